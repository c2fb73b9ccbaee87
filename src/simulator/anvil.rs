//! Anvil-backed simulator: forks upstream state into a child node, replays
//! the candidate transaction under impersonation, and reverts.

use serde_json::{json, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::models::{
    AssetChange, CallTrace, EventLog, SimulationRequest, SimulationResult, NATIVE_ASSET,
    WHOLE_UNIT,
};
use super::rpc::{decode_quantity, encode_quantity, RpcClient};
use super::{BalanceInfo, CodeInfo, Simulator, SimulatorError, SANDBOX_CHAIN_ID};
use crate::config::SimulatorConfig;

/// Interval between receipt polls.
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Ports probed upward from the configured base before giving up.
const PORT_PROBE_ATTEMPTS: u16 = 100;

struct Running {
    child: Child,
    rpc: RpcClient,
    port: u16,
    fork_block: u64,
}

/// One anvil child process plus the JSON-RPC session against it.
///
/// All node interaction is serialized behind one async mutex, so a single
/// instance never services two concurrent RPC conversations.
pub struct AnvilSimulator {
    config: SimulatorConfig,
    state: Mutex<Option<Running>>,
}

impl AnvilSimulator {
    #[must_use]
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(None),
        }
    }

    /// The loopback RPC endpoint, when running.
    pub async fn rpc_url(&self) -> Option<String> {
        let state = self.state.lock().await;
        state
            .as_ref()
            .map(|r| format!("http://127.0.0.1:{}", r.port))
    }

    async fn start_locked(&self, state: &mut Option<Running>) -> Result<u64, SimulatorError> {
        if let Some(running) = state.as_ref() {
            return Ok(running.fork_block);
        }

        let port = find_free_port(self.config.base_port)?;
        let endpoint = format!("http://127.0.0.1:{port}");

        let mut command = Command::new(&self.config.binary);
        command
            .arg("--fork-url")
            .arg(&self.config.fork_url)
            .arg("--port")
            .arg(port.to_string())
            .arg("--host")
            .arg("127.0.0.1")
            .arg("--chain-id")
            .arg(SANDBOX_CHAIN_ID.to_string())
            .arg("--block-time")
            .arg("0");
        if let Some(block) = self.config.fork_block {
            command.arg("--fork-block-number").arg(block.to_string());
        }
        command
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        debug!(port, binary = %self.config.binary, "spawning sandbox node");
        let mut child = command.spawn().map_err(|e| SimulatorError::Startup {
            message: format!("failed to spawn {}: {e}", self.config.binary),
        })?;

        let rpc = RpcClient::new(endpoint, self.config.deadline());
        let fork_block = match wait_until_ready(&rpc, self.config.deadline()).await {
            Ok(latest) => self.config.fork_block.unwrap_or(latest),
            Err(err) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(err);
            }
        };

        *state = Some(Running {
            child,
            rpc,
            port,
            fork_block,
        });
        Ok(fork_block)
    }

    #[instrument(skip(self, running, request), fields(to = %request.tx_to))]
    async fn simulate_locked(
        &self,
        running: &mut Running,
        request: &SimulationRequest,
    ) -> Result<SimulationResult, SimulatorError> {
        let fork_block = running.fork_block;
        let rpc = &running.rpc;
        let snapshot: String = rpc.call("evm_snapshot", json!([])).await?;

        let outcome = self.execute_under_snapshot(rpc, request, fork_block).await;

        // Revert runs on every exit path; failure to revert poisons the
        // instance, so surface it over an execution error.
        let reverted: Result<bool, _> = rpc.call("evm_revert", json!([snapshot])).await;
        match (outcome, reverted) {
            (Ok(result), Ok(_)) => Ok(result),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), _) => Err(e),
        }
    }

    async fn execute_under_snapshot(
        &self,
        rpc: &RpcClient,
        request: &SimulationRequest,
        fork_block: u64,
    ) -> Result<SimulationResult, SimulatorError> {
        let holders = balance_holders(request);
        let before = fetch_balances(rpc, &holders).await?;

        rpc.call::<Value>("anvil_impersonateAccount", json!([request.tx_from]))
            .await?;
        let executed = self.send_and_wait(rpc, request).await;
        // Impersonation is per-instance mutable state; always clear it.
        let _ = rpc
            .call::<Value>("anvil_stopImpersonatingAccount", json!([request.tx_from]))
            .await;
        let (receipt, trace) = executed?;

        let after = fetch_balances(rpc, &holders).await?;
        let asset_changes = diff_balances(&holders, &before, &after);

        let success = receipt
            .get("status")
            .and_then(Value::as_str)
            .map(|s| decode_quantity(s).unwrap_or(0) == 1)
            .unwrap_or(false);
        let gas_used = receipt
            .get("gasUsed")
            .and_then(Value::as_str)
            .and_then(|s| decode_quantity(s).ok())
            .unwrap_or(0) as u64;

        let mut call_traces = vec![root_frame(request)];
        call_traces.extend(parse_struct_logs(trace.as_ref()));
        let events = parse_receipt_logs(&receipt);

        let mut result = SimulationResult {
            chain_id: request.chain_id,
            block_number: fork_block,
            tx_from: request.tx_from.clone(),
            tx_to: request.tx_to.clone(),
            tx_value: request.tx_value.clone(),
            tx_data: request.tx_data.clone(),
            success,
            gas_used,
            gas_limit: request.gas_limit,
            error_message: (!success).then(|| "execution reverted".to_string()),
            asset_changes,
            call_traces,
            events,
            anomalies: Vec::new(),
            risk_level: Default::default(),
        };
        result.anomalies = builtin_anomalies(&result);
        Ok(result)
    }

    async fn send_and_wait(
        &self,
        rpc: &RpcClient,
        request: &SimulationRequest,
    ) -> Result<(Value, Option<Value>), SimulatorError> {
        let nonce: String = rpc
            .call("eth_getTransactionCount", json!([request.tx_from, "latest"]))
            .await?;
        let value_units: u128 = request.tx_value.parse().unwrap_or(0);

        let tx = json!({
            "from": request.tx_from,
            "to": request.tx_to,
            "value": encode_quantity(value_units),
            "data": request.tx_data,
            "gas": encode_quantity(u128::from(request.gas_limit)),
            "nonce": nonce,
            "chainId": encode_quantity(u128::from(SANDBOX_CHAIN_ID)),
        });
        let tx_hash: String = rpc.call("eth_sendTransaction", json!([tx])).await?;

        let receipt = self.wait_for_receipt(rpc, &tx_hash).await?;

        // A missing trace degrades detail but never fails the simulation.
        let trace = match rpc
            .call::<Value>("debug_traceTransaction", json!([tx_hash, {}]))
            .await
        {
            Ok(trace) => Some(trace),
            Err(e) => {
                warn!(error = %e, "execution trace unavailable");
                None
            }
        };

        Ok((receipt, trace))
    }

    async fn wait_for_receipt(
        &self,
        rpc: &RpcClient,
        tx_hash: &str,
    ) -> Result<Value, SimulatorError> {
        let deadline = tokio::time::Instant::now() + self.config.deadline();
        loop {
            let receipt: Option<Value> = rpc
                .call("eth_getTransactionReceipt", json!([tx_hash]))
                .await?;
            if let Some(receipt) = receipt.filter(|r| !r.is_null()) {
                return Ok(receipt);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SimulatorError::ReceiptTimeout {
                    seconds: self.config.timeout,
                });
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }

}

#[async_trait::async_trait]
impl Simulator for AnvilSimulator {
    async fn ensure_started(&self) -> Result<u64, SimulatorError> {
        let mut state = self.state.lock().await;
        self.start_locked(&mut state).await
    }

    async fn simulate(
        &self,
        request: &SimulationRequest,
    ) -> Result<SimulationResult, SimulatorError> {
        let mut state = self.state.lock().await;
        self.start_locked(&mut state).await?;
        let running = state.as_mut().ok_or(SimulatorError::NotRunning)?;
        self.simulate_locked(running, request).await
    }

    async fn get_balance(
        &self,
        address: &str,
        token: Option<&str>,
    ) -> Result<BalanceInfo, SimulatorError> {
        if let Some(token) = token.filter(|t| *t != NATIVE_ASSET) {
            return Err(SimulatorError::Unsupported {
                message: format!("token balance lookup not supported (token {token})"),
            });
        }
        let state = self.state.lock().await;
        let running = state.as_ref().ok_or(SimulatorError::NotRunning)?;
        let raw: String = running
            .rpc
            .call("eth_getBalance", json!([address, "latest"]))
            .await?;
        let balance = decode_quantity(&raw)?;
        Ok(BalanceInfo {
            address: address.to_string(),
            token_symbol: "ETH".into(),
            balance: balance.to_string(),
            whole_units: balance as f64 / WHOLE_UNIT as f64,
        })
    }

    async fn get_code(&self, address: &str) -> Result<CodeInfo, SimulatorError> {
        let state = self.state.lock().await;
        let running = state.as_ref().ok_or(SimulatorError::NotRunning)?;
        let code: String = running
            .rpc
            .call("eth_getCode", json!([address, "latest"]))
            .await?;
        let body = code.strip_prefix("0x").unwrap_or(&code);
        let is_contract = !body.is_empty();
        Ok(CodeInfo {
            address: address.to_string(),
            is_contract,
            code_length: body.len() / 2,
            code_hash_prefix: is_contract.then(|| body.chars().take(64).collect()),
        })
    }

    async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if let Some(mut running) = state.take() {
            let _ = running.child.start_kill();
            let _ = running.child.wait().await;
            debug!(port = running.port, "sandbox node stopped");
        }
    }

    async fn is_running(&self) -> bool {
        let mut state = self.state.lock().await;
        match state.as_mut() {
            Some(running) => running.child.try_wait().map(|s| s.is_none()).unwrap_or(false),
            None => false,
        }
    }
}

/// Probe loopback ports upward from `base` until one binds.
fn find_free_port(base: u16) -> Result<u16, SimulatorError> {
    for offset in 0..PORT_PROBE_ATTEMPTS {
        let port = base.saturating_add(offset);
        if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
    }
    Err(SimulatorError::PortExhausted {
        base,
        attempts: PORT_PROBE_ATTEMPTS,
    })
}

/// Poll `eth_blockNumber` until the node answers or the deadline passes.
/// Returns the latest block number.
async fn wait_until_ready(rpc: &RpcClient, deadline: Duration) -> Result<u64, SimulatorError> {
    let give_up = tokio::time::Instant::now() + deadline;
    loop {
        match rpc.call::<String>("eth_blockNumber", json!([])).await {
            Ok(raw) => return Ok(decode_quantity(&raw)? as u64),
            Err(_) if tokio::time::Instant::now() < give_up => {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(_) => {
                return Err(SimulatorError::StartupTimeout {
                    seconds: deadline.as_secs_f64(),
                })
            }
        }
    }
}

/// Addresses whose balances are diffed: sender first, recipient next.
fn balance_holders(request: &SimulationRequest) -> Vec<String> {
    let mut holders = vec![request.tx_from.clone()];
    if request.tx_to != request.tx_from && request.tx_to != NATIVE_ASSET {
        holders.push(request.tx_to.clone());
    }
    holders
}

async fn fetch_balances(
    rpc: &RpcClient,
    holders: &[String],
) -> Result<Vec<u128>, SimulatorError> {
    let mut balances = Vec::with_capacity(holders.len());
    for holder in holders {
        let raw: String = rpc.call("eth_getBalance", json!([holder, "latest"])).await?;
        balances.push(decode_quantity(&raw)?);
    }
    Ok(balances)
}

/// Diff pre/post balances into asset-change rows, omitting zero deltas and
/// preserving holder order.
fn diff_balances(holders: &[String], before: &[u128], after: &[u128]) -> Vec<AssetChange> {
    holders
        .iter()
        .zip(before.iter().zip(after.iter()))
        .filter(|(_, (b, a))| b != a)
        .map(|(holder, (b, a))| AssetChange {
            holder: holder.clone(),
            token_address: NATIVE_ASSET.into(),
            token_symbol: "ETH".into(),
            token_decimals: 18,
            balance_before: b.to_string(),
            balance_after: a.to_string(),
            change_amount: (*a as i128 - *b as i128).to_string(),
        })
        .collect()
}

/// Synthetic depth-0 frame for the top-level call, so detectors see the
/// candidate invocation itself.
fn root_frame(request: &SimulationRequest) -> CallTrace {
    CallTrace {
        depth: 0,
        from_address: request.tx_from.clone(),
        to_address: request.tx_to.clone(),
        value: request.tx_value.clone(),
        input_data: request.tx_data.clone(),
        output_data: "0x".into(),
        gas_used: 0,
        call_type: Some("call".into()),
        error: None,
    }
}

fn parse_struct_logs(trace: Option<&Value>) -> Vec<CallTrace> {
    let Some(logs) = trace
        .and_then(|t| t.get("structLogs"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    logs.iter()
        .map(|log| CallTrace {
            depth: log.get("depth").and_then(Value::as_u64).unwrap_or(0) as u32,
            from_address: str_field(log, "from"),
            to_address: str_field(log, "to"),
            value: log
                .get("value")
                .and_then(Value::as_str)
                .unwrap_or("0")
                .to_string(),
            input_data: log
                .get("input")
                .and_then(Value::as_str)
                .unwrap_or("0x")
                .to_string(),
            output_data: log
                .get("output")
                .and_then(Value::as_str)
                .unwrap_or("0x")
                .to_string(),
            gas_used: log.get("gasCost").and_then(Value::as_u64).unwrap_or(0),
            call_type: log
                .get("op")
                .and_then(Value::as_str)
                .map(|s| s.to_lowercase()),
            error: log
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
        .collect()
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

fn parse_receipt_logs(receipt: &Value) -> Vec<EventLog> {
    let Some(logs) = receipt.get("logs").and_then(Value::as_array) else {
        return Vec::new();
    };
    logs.iter()
        .map(|log| EventLog {
            address: str_field(log, "address"),
            topics: log
                .get("topics")
                .and_then(Value::as_array)
                .map(|topics| {
                    topics
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            data: log
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or("0x")
                .to_string(),
            log_index: log
                .get("logIndex")
                .and_then(Value::as_str)
                .and_then(|s| decode_quantity(s).ok())
                .unwrap_or(0) as u64,
        })
        .collect()
}

/// Built-in anomaly rules run on every simulation result.
fn builtin_anomalies(result: &SimulationResult) -> Vec<String> {
    let mut anomalies = Vec::new();

    if !result.success {
        anomalies.push(format!(
            "transaction execution failed: {}",
            result.error_message.as_deref().unwrap_or("unknown error")
        ));
    }

    let outflow = -result.sender_native_delta();
    let unexplained = outflow - result.declared_value().max(0);
    if unexplained >= WHOLE_UNIT {
        anomalies.push(format!(
            "native outflow exceeds the declared value by {:.4} units",
            unexplained as f64 / WHOLE_UNIT as f64
        ));
    }

    let max_depth = result.max_call_depth();
    if max_depth > 20 {
        anomalies.push(format!(
            "call depth {max_depth} exceeds the reentrancy watermark"
        ));
    }

    anomalies
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RiskLevel;

    fn result_with(success: bool, changes: Vec<AssetChange>, depths: Vec<u32>) -> SimulationResult {
        SimulationResult {
            chain_id: 1,
            block_number: 1,
            tx_from: "0x1111111111111111111111111111111111111111".into(),
            tx_to: "0x2222222222222222222222222222222222222222".into(),
            tx_value: "0".into(),
            tx_data: "0x".into(),
            success,
            gas_used: 0,
            gas_limit: 30_000_000,
            error_message: (!success).then(|| "execution reverted".into()),
            asset_changes: changes,
            call_traces: depths
                .into_iter()
                .map(|depth| CallTrace {
                    depth,
                    ..CallTrace::default()
                })
                .collect(),
            events: vec![],
            anomalies: vec![],
            risk_level: RiskLevel::Safe,
        }
    }

    #[test]
    fn failure_is_an_anomaly() {
        let anomalies = builtin_anomalies(&result_with(false, vec![], vec![]));
        assert!(anomalies[0].contains("execution failed"));
    }

    #[test]
    fn intended_value_is_not_an_outflow_anomaly() {
        let mut result = result_with(
            true,
            vec![AssetChange {
                holder: "0x1111111111111111111111111111111111111111".into(),
                token_address: NATIVE_ASSET.into(),
                token_symbol: "ETH".into(),
                token_decimals: 18,
                balance_before: "0".into(),
                balance_after: "0".into(),
                change_amount: (-WHOLE_UNIT).to_string(),
            }],
            vec![],
        );
        result.tx_value = WHOLE_UNIT.to_string();
        assert!(builtin_anomalies(&result).is_empty());

        result.tx_value = "0".into();
        let anomalies = builtin_anomalies(&result);
        assert_eq!(anomalies.len(), 1);
        assert!(anomalies[0].contains("declared value"));
    }

    #[test]
    fn deep_stack_is_an_anomaly() {
        let anomalies = builtin_anomalies(&result_with(true, vec![], vec![0, 10, 21]));
        assert!(anomalies.iter().any(|a| a.contains("call depth 21")));
        let quiet = builtin_anomalies(&result_with(true, vec![], vec![0, 10, 20]));
        assert!(quiet.is_empty());
    }

    #[test]
    fn struct_log_parsing_copies_depth_and_op() {
        let trace = json!({
            "structLogs": [
                {"depth": 1, "op": "CALL", "gasCost": 700},
                {"depth": 2, "op": "DELEGATECALL", "input": "0x095ea7b3"},
            ]
        });
        let frames = parse_struct_logs(Some(&trace));
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].depth, 1);
        assert_eq!(frames[0].call_type.as_deref(), Some("call"));
        assert_eq!(frames[1].call_type.as_deref(), Some("delegatecall"));
        assert_eq!(frames[1].input_data, "0x095ea7b3");
    }

    #[test]
    fn balance_diff_omits_zero_deltas_and_keeps_order() {
        let holders = vec!["0xaa".to_string(), "0xbb".to_string()];
        let before = vec![10u128, 5];
        let after = vec![10u128, 7];
        let changes = diff_balances(&holders, &before, &after);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].holder, "0xbb");
        assert_eq!(changes[0].change_amount, "2");
    }

    #[test]
    fn root_frame_carries_the_candidate_call() {
        let request = SimulationRequest {
            chain_id: 1,
            tx_from: "0x1111111111111111111111111111111111111111".into(),
            tx_to: "0x2222222222222222222222222222222222222222".into(),
            tx_value: "5".into(),
            tx_data: "0x095ea7b3".into(),
            fork_block: None,
            gas_limit: 30_000_000,
        };
        let frame = root_frame(&request);
        assert_eq!(frame.depth, 0);
        assert_eq!(frame.selector(), Some("0x095ea7b3"));
    }

    #[test]
    fn port_probe_finds_a_port() {
        // Binding from an ephemeral-range base must succeed somewhere.
        let port = find_free_port(34567).unwrap();
        assert!(port >= 34567);
    }

    #[tokio::test]
    async fn token_balance_lookup_is_unsupported() {
        let simulator = AnvilSimulator::new(SimulatorConfig::default());
        let err = simulator
            .get_balance(
                "0x1111111111111111111111111111111111111111",
                Some("0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SimulatorError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn queries_require_a_running_node() {
        let simulator = AnvilSimulator::new(SimulatorConfig::default());
        assert!(matches!(
            simulator
                .get_code("0x1111111111111111111111111111111111111111")
                .await
                .unwrap_err(),
            SimulatorError::NotRunning
        ));
        assert!(!simulator.is_running().await);
        // Shutdown with no child is a no-op.
        simulator.shutdown().await;
    }
}
