//! Perception: turn free-form input into a normalized, classified record.

use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;

use crate::context::{AuditContext, ParsedIntent, PerceptionOutput, RawTransaction};
use crate::simulator::models::{SimulationRequest, WHOLE_UNIT};
use crate::stage::{Stage, StageEnv, StageError, StageReport};
use crate::types::{Complexity, IntentCategory, NextStep, StageName};

static AMOUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)\s*(?:eth|usdc|usdt|dai|wbtc)?").expect("amount regex")
});

static SLIPPAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:slippage|slip)\s*(?:of\s*)?(\d+(?:\.\d+)?)%?").expect("slippage regex")
});

/// Calldata length (hex characters) below which a task stays simple.
const SIMPLE_CALLDATA_LEN: usize = 200;
/// Calldata length above which a task is complex.
const MEDIUM_CALLDATA_LEN: usize = 1000;

pub struct PerceptionStage;

#[async_trait]
impl Stage for PerceptionStage {
    fn name(&self) -> StageName {
        StageName::Perception
    }

    async fn run(
        &self,
        ctx: &mut AuditContext,
        env: &StageEnv,
    ) -> Result<StageReport, StageError> {
        if ctx.user_intent.trim().is_empty() {
            return Err(StageError::Validation {
                message: "user_intent must be non-empty".into(),
            });
        }

        let intent = parse_intent(&ctx.user_intent);
        let mut warnings = Vec::new();
        let request = validate_tx(&ctx.raw_tx, &mut warnings)?;
        let complexity = classify(intent.category, &request.tx_data);
        env.emit(
            StageName::Perception,
            "classify",
            format!("category={} complexity={complexity}", intent.category),
        );

        let next = next_step(complexity);
        ctx.perception = Some(PerceptionOutput {
            intent,
            request,
            complexity,
            warnings,
        });
        Ok(StageReport::ok(0.95, next))
    }
}

/// Classify the intent text and extract amounts and slippage tolerance.
#[must_use]
pub fn parse_intent(text: &str) -> ParsedIntent {
    let lowered = text.to_lowercase();

    let category = if lowered.contains("swap") || lowered.contains("exchange") {
        IntentCategory::Swap
    } else if lowered.contains("approve") || lowered.contains("authorize") {
        IntentCategory::Approve
    } else if lowered.contains("transfer") || lowered.contains("send") {
        IntentCategory::Transfer
    } else if lowered.contains("mint") {
        IntentCategory::Mint
    } else if lowered.contains("stake") || lowered.contains("deposit") {
        IntentCategory::Stake
    } else if lowered.contains("claim") {
        IntentCategory::Claim
    } else {
        IntentCategory::Unknown
    };

    let amounts = AMOUNT_RE
        .captures_iter(&lowered)
        .map(|c| c[1].to_string())
        .collect();

    let slippage_tolerance = SLIPPAGE_RE
        .captures(&lowered)
        .and_then(|c| c[1].parse::<f64>().ok())
        .map(|pct| pct / 100.0);

    ParsedIntent {
        category,
        amounts,
        slippage_tolerance,
        raw: text.to_string(),
    }
}

/// Validate and normalize the raw transaction fields.
pub fn validate_tx(
    raw: &RawTransaction,
    warnings: &mut Vec<String>,
) -> Result<SimulationRequest, StageError> {
    let tx_from = normalize_address(&raw.tx_from, "tx_from")?;
    let tx_to = normalize_address(&raw.tx_to, "tx_to")?;
    let tx_value = normalize_value(&raw.tx_value, warnings)?;
    let tx_data = normalize_calldata(raw.tx_data.as_deref(), warnings);

    Ok(SimulationRequest {
        chain_id: raw.chain_id,
        tx_from,
        tx_to,
        tx_value,
        tx_data,
        fork_block: raw.fork_block,
        gas_limit: raw.gas_limit.unwrap_or(30_000_000),
    })
}

fn normalize_address(address: &str, field: &str) -> Result<String, StageError> {
    if address.is_empty() {
        return Err(StageError::Validation {
            message: format!("missing required field {field}"),
        });
    }
    let lowered = address.to_lowercase();
    if !crate::simulator::models::is_address(&lowered) {
        return Err(StageError::Validation {
            message: format!("{field} is not a 20-byte hex address: {address}"),
        });
    }
    Ok(lowered)
}

/// Normalize a value in any accepted encoding to a canonical decimal string.
///
/// Decimal strings pass through, `0x` strings decode as hex, and floating
/// forms (number or text) are whole units converted at 18 decimals.
fn normalize_value(
    value: &serde_json::Value,
    warnings: &mut Vec<String>,
) -> Result<String, StageError> {
    match value {
        serde_json::Value::Null => Ok("0".to_string()),
        serde_json::Value::Number(n) => {
            if let Some(int) = n.as_u64() {
                Ok(int.to_string())
            } else if n.as_i64().is_some() || n.as_f64().is_some_and(|f| f < 0.0) {
                Err(StageError::Validation {
                    message: format!("tx_value cannot be negative: {n}"),
                })
            } else if let Some(float) = n.as_f64() {
                warnings.push("tx_value given in whole units; converted to base units".into());
                Ok(whole_units_to_base(float))
            } else {
                Err(StageError::Validation {
                    message: format!("tx_value is not a valid amount: {n}"),
                })
            }
        }
        serde_json::Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok("0".to_string());
            }
            if let Some(hex_part) = s.strip_prefix("0x") {
                let parsed =
                    u128::from_str_radix(hex_part, 16).map_err(|_| StageError::Validation {
                        message: format!("tx_value is not valid hex: {s}"),
                    })?;
                warnings.push("tx_value given as hex; converted to decimal".into());
                return Ok(parsed.to_string());
            }
            if s.contains('.') {
                let float: f64 = s.parse().map_err(|_| StageError::Validation {
                    message: format!("tx_value is not a number: {s}"),
                })?;
                warnings.push("tx_value given in whole units; converted to base units".into());
                return Ok(whole_units_to_base(float));
            }
            if s.bytes().all(|b| b.is_ascii_digit()) {
                return Ok(s.to_string());
            }
            Err(StageError::Validation {
                message: format!("tx_value is not a valid amount: {s}"),
            })
        }
        other => Err(StageError::Validation {
            message: format!("tx_value has unsupported type: {other}"),
        }),
    }
}

fn whole_units_to_base(units: f64) -> String {
    ((units * WHOLE_UNIT as f64).round() as i128).max(0).to_string()
}

fn normalize_calldata(data: Option<&str>, warnings: &mut Vec<String>) -> String {
    let Some(data) = data else {
        return "0x".to_string();
    };
    let mut normalized = data.trim().to_lowercase();
    if !normalized.starts_with("0x") {
        warnings.push("tx_data missing 0x prefix; prefixed".into());
        normalized = format!("0x{normalized}");
    }
    if !crate::simulator::models::is_hex_data(&normalized) {
        warnings.push("tx_data contains non-hex characters".into());
    }
    normalized
}

/// Derive task complexity from calldata size with a floor of `medium` for
/// swap and approve intents.
#[must_use]
pub fn classify(category: IntentCategory, calldata: &str) -> Complexity {
    let size = calldata.len();
    let mut complexity = if size > MEDIUM_CALLDATA_LEN {
        Complexity::Complex
    } else if size > SIMPLE_CALLDATA_LEN {
        Complexity::Medium
    } else {
        Complexity::Simple
    };
    if matches!(category, IntentCategory::Swap | IntentCategory::Approve) {
        complexity = complexity.max(Complexity::Medium);
    }
    complexity
}

/// Complex tasks get a plan; everything else goes straight to execution.
#[must_use]
pub fn next_step(complexity: Complexity) -> NextStep {
    if complexity == Complexity::Complex {
        NextStep::Planner
    } else {
        NextStep::Executor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn intent_categories() {
        assert_eq!(
            parse_intent("Swap 1 ETH to USDC").category,
            IntentCategory::Swap
        );
        assert_eq!(
            parse_intent("please AUTHORIZE spending").category,
            IntentCategory::Approve
        );
        assert_eq!(
            parse_intent("send 5 usdc to alice").category,
            IntentCategory::Transfer
        );
        assert_eq!(parse_intent("stake for yield").category, IntentCategory::Stake);
        assert_eq!(parse_intent("claim rewards").category, IntentCategory::Claim);
        assert_eq!(parse_intent("do the thing").category, IntentCategory::Unknown);
    }

    #[test]
    fn amounts_and_slippage() {
        let intent = parse_intent("Swap 1 ETH to USDC, slippage 0.5%");
        assert!(intent.amounts.contains(&"1".to_string()));
        assert_eq!(intent.slippage_tolerance, Some(0.005));

        let none = parse_intent("swap eth");
        assert_eq!(none.slippage_tolerance, None);
    }

    fn raw(value: serde_json::Value) -> RawTransaction {
        RawTransaction {
            chain_id: 1,
            tx_from: "0x1111111111111111111111111111111111111111".into(),
            tx_to: "0x2222222222222222222222222222222222222222".into(),
            tx_value: value,
            tx_data: Some("0x".into()),
            gas_limit: None,
            fork_block: None,
        }
    }

    #[test]
    fn float_value_converts_to_base_units() {
        let mut warnings = Vec::new();
        let request = validate_tx(&raw(json!(1.5)), &mut warnings).unwrap();
        assert_eq!(request.tx_value, "1500000000000000000");
        assert!(!warnings.is_empty());
    }

    #[test]
    fn float_string_converts_too() {
        let mut warnings = Vec::new();
        let request = validate_tx(&raw(json!("1.5")), &mut warnings).unwrap();
        assert_eq!(request.tx_value, "1500000000000000000");
    }

    #[test]
    fn hex_value_converts_to_decimal() {
        let mut warnings = Vec::new();
        let request = validate_tx(&raw(json!("0xde0b6b3a7640000")), &mut warnings).unwrap();
        assert_eq!(request.tx_value, "1000000000000000000");
    }

    #[test]
    fn decimal_value_passes_through() {
        let mut warnings = Vec::new();
        let request = validate_tx(&raw(json!("42")), &mut warnings).unwrap();
        assert_eq!(request.tx_value, "42");
        assert!(warnings.is_empty());
    }

    #[test]
    fn missing_value_and_data_default() {
        let mut transaction = raw(serde_json::Value::Null);
        transaction.tx_data = None;
        let mut warnings = Vec::new();
        let request = validate_tx(&transaction, &mut warnings).unwrap();
        assert_eq!(request.tx_value, "0");
        assert_eq!(request.tx_data, "0x");
    }

    #[test]
    fn addresses_are_lowercased() {
        let mut transaction = raw(json!("0"));
        transaction.tx_from = "0xDeAdBeEfDeAdBeEfDeAdBeEfDeAdBeEfDeAdBeEf".into();
        let mut warnings = Vec::new();
        let request = validate_tx(&transaction, &mut warnings).unwrap();
        assert_eq!(
            request.tx_from,
            "0xdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef"
        );
    }

    #[test]
    fn invalid_address_is_a_validation_error() {
        let mut transaction = raw(json!("0"));
        transaction.tx_to = "0x1234".into();
        let mut warnings = Vec::new();
        let err = validate_tx(&transaction, &mut warnings).unwrap_err();
        assert!(matches!(err, StageError::Validation { .. }));
    }

    #[test]
    fn unparseable_value_is_a_validation_error() {
        let mut warnings = Vec::new();
        let err = validate_tx(&raw(json!("lots")), &mut warnings).unwrap_err();
        assert!(matches!(err, StageError::Validation { .. }));
    }

    #[test]
    fn calldata_prefix_is_forced_with_warning() {
        let mut transaction = raw(json!("0"));
        transaction.tx_data = Some("A9059CBB".into());
        let mut warnings = Vec::new();
        let request = validate_tx(&transaction, &mut warnings).unwrap();
        assert_eq!(request.tx_data, "0xa9059cbb");
        assert!(warnings.iter().any(|w| w.contains("prefix")));
    }

    #[test]
    fn normalization_is_idempotent() {
        let mut warnings = Vec::new();
        let first = validate_tx(&raw(json!("1.5")), &mut warnings).unwrap();

        let renormalized = RawTransaction {
            chain_id: first.chain_id,
            tx_from: first.tx_from.clone(),
            tx_to: first.tx_to.clone(),
            tx_value: json!(first.tx_value.clone()),
            tx_data: Some(first.tx_data.clone()),
            gas_limit: Some(first.gas_limit),
            fork_block: first.fork_block,
        };
        let mut warnings = Vec::new();
        let second = validate_tx(&renormalized, &mut warnings).unwrap();
        assert_eq!(first, second);
        assert!(warnings.is_empty());
    }

    #[test]
    fn complexity_thresholds() {
        let short = "0x".to_string() + &"0".repeat(100);
        let medium = "0x".to_string() + &"0".repeat(500);
        let long = "0x".to_string() + &"0".repeat(1100);
        assert_eq!(classify(IntentCategory::Unknown, &short), Complexity::Simple);
        assert_eq!(classify(IntentCategory::Unknown, &medium), Complexity::Medium);
        assert_eq!(classify(IntentCategory::Unknown, &long), Complexity::Complex);
    }

    #[test]
    fn swap_and_approve_floor_at_medium() {
        assert_eq!(classify(IntentCategory::Swap, "0x"), Complexity::Medium);
        assert_eq!(classify(IntentCategory::Approve, "0x"), Complexity::Medium);
        let long = "0x".to_string() + &"0".repeat(1100);
        assert_eq!(classify(IntentCategory::Swap, &long), Complexity::Complex);
    }

    #[test]
    fn routing() {
        assert_eq!(next_step(Complexity::Simple), NextStep::Executor);
        assert_eq!(next_step(Complexity::Medium), NextStep::Executor);
        assert_eq!(next_step(Complexity::Complex), NextStep::Planner);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn arbitrary_value_strings_never_panic(s in "\\PC{0,40}") {
                let mut warnings = Vec::new();
                let _ = normalize_value(&json!(s), &mut warnings);
            }

            #[test]
            fn canonical_decimal_values_are_fixed_points(n: u64) {
                let mut warnings = Vec::new();
                let normalized =
                    normalize_value(&json!(n.to_string()), &mut warnings).unwrap();
                prop_assert_eq!(normalized, n.to_string());
                prop_assert!(warnings.is_empty());
            }

            #[test]
            fn intent_parsing_never_panics(text in "\\PC{0,200}") {
                let _ = parse_intent(&text);
            }
        }
    }
}
