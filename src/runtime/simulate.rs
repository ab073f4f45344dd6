// In-process simulation
//
// Runs every role of a compiled definition concurrently on an in-memory
// network, one future per role, and collects the per-role outcomes together
// with the recorded communication log.

use std::sync::{Arc, Mutex};

use futures::future::join_all;

use crate::compiler::registry::{Context, Definition};
use crate::runtime::transport::{in_memory_network, CommEvent, Recording};
use crate::runtime::{play_role, RoleConfig, RuntimeError, Value};

/// The outcome of a simulation: one result per role, in role order, plus
/// the communication log in send order.
pub struct Simulation {
    pub results: Vec<Result<Value, RuntimeError>>,
    pub log: Vec<CommEvent>,
}

impl Simulation {
    /// All per-role values; the first failure wins.
    pub fn values(self) -> Result<Vec<Value>, RuntimeError> {
        self.results.into_iter().collect()
    }

    /// The log as `Src->Dst:value` strings under the definition's roles.
    pub fn log_strings(&self, def: &Definition) -> Vec<String> {
        self.log
            .iter()
            .map(|e| format!("{}->{}:{}", def.roles[e.from], def.roles[e.to], e.value))
            .collect()
    }
}

/// Simulate `def` with per-role argument lists (already erased: each role
/// passes only the arguments for parameters its type mentions).
pub async fn simulate(
    ctx: &Context,
    def: &Definition,
    args: Vec<Vec<Value>>,
) -> Result<Simulation, RuntimeError> {
    let n = def.roles.len();
    if args.len() != n {
        return Err(RuntimeError::BadArgument(format!(
            "{} has {} roles, {} argument lists given",
            def.name,
            n,
            args.len()
        )));
    }
    let log = Arc::new(Mutex::new(Vec::new()));
    let endpoints = in_memory_network(n);
    let runs = endpoints.into_iter().zip(args).enumerate().map(|(i, (endpoint, role_args))| {
        let role = def.roles[i].clone();
        let log = log.clone();
        async move {
            let mut config =
                RoleConfig { role, transport: Recording::new(endpoint, i, log) };
            play_role(ctx, &mut config, def, role_args).await
        }
    });
    let results = join_all(runs).await;
    let log = log.lock().expect("communication log poisoned").clone();
    Ok(Simulation { results, log })
}
