//! Dispatch for instructions arriving over the worker's watch channel.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vmfleet_model::WatchInstruction;

use crate::client::ControllerClient;
use crate::engine::Reconciler;

pub struct InstructionHandler {
    engine: Arc<Reconciler>,
    client: Arc<dyn ControllerClient>,
}

impl InstructionHandler {
    pub fn new(engine: Arc<Reconciler>, client: Arc<dyn ControllerClient>) -> Self {
        InstructionHandler { engine, client }
    }

    /// Consume the watch channel until it closes or `caller` is
    /// cancelled.
    pub async fn run(&self, mut watch: mpsc::Receiver<WatchInstruction>, caller: CancellationToken) {
        loop {
            tokio::select! {
                instruction = watch.recv() => {
                    match instruction {
                        Some(instruction) => self.dispatch(&caller, instruction).await,
                        None => {
                            info!("Watch channel closed");
                            break;
                        }
                    }
                }
                _ = caller.cancelled() => {
                    info!("Watch consumer cancelled");
                    break;
                }
            }
        }
    }

    pub async fn dispatch(&self, caller: &CancellationToken, instruction: WatchInstruction) {
        match instruction {
            WatchInstruction::SyncVms(_) => {
                debug!("Sync nudge received");
                self.engine.request_sync();
            }
            WatchInstruction::ResolveIp(action) => {
                let (ip, error_message) =
                    match self.engine.resolve_ip(caller, &action.vm_uid).await {
                        Ok(ip) => (Some(ip), None),
                        Err(e) => (None, Some(e.to_string())),
                    };
                if let Err(e) = self
                    .client
                    .respond_ip(&action.session, ip, error_message)
                    .await
                {
                    // Benign when the requester already gave up.
                    debug!(error = %e, "Resolve-IP callback not delivered");
                }
            }
            // Back-connections for port-forward and exec ride the RPC
            // transport, which plugs in at a different layer.
            WatchInstruction::PortForward(action) => {
                warn!(vm_uid = %action.vm_uid, port = action.port,
                    "Port-forward requested but no connection transport is configured");
            }
            WatchInstruction::Exec(action) => {
                warn!(vm_uid = %action.vm_uid, command = %action.command,
                    "Exec requested but no connection transport is configured");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use vmfleet_model::{ResolveIpAction, Resources, Vm, RESOURCE_VMS};
    use vmfleet_store::Store;
    use crate::client::MockController;
    use crate::driver::MockDriverFactory;
    use crate::engine::ReconcilerConfig;

    fn handler() -> (Arc<Store>, Arc<MockController>, InstructionHandler) {
        let store = Arc::new(Store::new());
        let client = Arc::new(MockController::new(Arc::clone(&store)));
        let engine = Arc::new(Reconciler::new(
            Arc::clone(&client) as _,
            Arc::new(MockDriverFactory::new()),
            ReconcilerConfig {
                worker_name: "w1".to_owned(),
                machine_id: "m1".to_owned(),
                resources: Resources::from([(RESOURCE_VMS, 2)]),
                sync_interval: Duration::from_secs(5),
            },
        ));
        let handler = InstructionHandler::new(engine, Arc::clone(&client) as _);
        (store, client, handler)
    }

    #[tokio::test]
    async fn resolve_ip_answers_through_the_client() {
        let (store, client, handler) = handler();
        let mut vm = Vm::new("a", "img");
        vm.worker = Some("w1".to_owned());
        let uid = vm.uid.clone();
        store.update(|txn| txn.set_vm(vm.clone())).unwrap();

        handler.engine.sync_vms().await.unwrap();

        let caller = CancellationToken::new();
        handler
            .dispatch(
                &caller,
                WatchInstruction::ResolveIp(ResolveIpAction {
                    session: "s1".into(),
                    vm_uid: uid,
                }),
            )
            .await;

        let replies = client.ip_replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].session, "s1");
        assert!(replies[0].ip.is_some());
        assert!(replies[0].error_message.is_none());
    }

    #[tokio::test]
    async fn resolve_ip_for_unknown_vm_reports_an_error_message() {
        let (_store, client, handler) = handler();

        let caller = CancellationToken::new();
        handler
            .dispatch(
                &caller,
                WatchInstruction::ResolveIp(ResolveIpAction {
                    session: "s1".into(),
                    vm_uid: "no-such-uid".into(),
                }),
            )
            .await;

        let replies = client.ip_replies();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].ip.is_none());
        assert!(replies[0].error_message.is_some());
    }
}
