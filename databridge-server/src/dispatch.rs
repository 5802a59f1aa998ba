//! Packet routing for connected clients
//!
//! Every inbound packet from a connection goes through [`HandlerContext`],
//! which gates unauthenticated console clients, routes by [`PacketKind`],
//! and tells the connection task what to do next. A kind with no installed
//! extension, a malformed payload, or a server-bound kind arriving from a
//! peer are all fatal for that connection.

use std::sync::Arc;

use tracing::{debug, warn};

use databridge_protocol::{
    AuthRequest, ChannelJoin, CommandRun, EventSubscription, Packet, PacketKind, StateUpdate,
};

use crate::console::ConsoleExtension;
use crate::registry::{ClientId, ClientRegistry};
use crate::sync::SyncExtension;

/// Outcome of routing one inbound packet
#[derive(Debug)]
pub enum Dispatch {
    /// Reply to the sending client
    Reply(Packet),
    /// Nothing to send back
    None,
    /// Fatal for this connection; close without replying
    Close,
}

/// Context for routing one connection's packets
pub struct HandlerContext {
    pub registry: Arc<ClientRegistry>,
    pub console: Option<Arc<ConsoleExtension>>,
    pub sync: Option<Arc<SyncExtension>>,
    pub client_id: ClientId,
}

impl HandlerContext {
    /// Route an inbound packet to the owning extension
    pub async fn route_packet(&self, packet: Packet) -> Dispatch {
        self.registry.touch(self.client_id);

        // Console gate: an unauthenticated client may only authenticate.
        if let Some(console) = &self.console {
            if packet.kind != PacketKind::AuthRequest && !console.is_authenticated(self.client_id)
            {
                warn!(
                    "{} sent {} before authenticating, closing",
                    self.client_id, packet.kind
                );
                return Dispatch::Close;
            }
        }

        match packet.kind {
            PacketKind::AuthRequest => {
                let Some(console) = &self.console else {
                    return self.violation("no console extension installed");
                };
                let Ok(request) = packet.data_as::<AuthRequest>() else {
                    // Malformed auth closes exactly like a bad secret
                    return Dispatch::Close;
                };
                match console.handle_auth(self.client_id, &request.secret) {
                    Some(reply) => Dispatch::Reply(reply),
                    None => Dispatch::Close,
                }
            }

            PacketKind::Keepalive => {
                if let Some(console) = &self.console {
                    console.handle_keepalive(self.client_id);
                }
                Dispatch::None
            }

            PacketKind::EventRegister => {
                let Some(console) = &self.console else {
                    return self.violation("no console extension installed");
                };
                let Ok(sub) = packet.data_as::<EventSubscription>() else {
                    return self.violation("malformed EVENT.REGISTER payload");
                };
                console.handle_register(self.client_id, sub.event_name);
                Dispatch::None
            }

            PacketKind::EventUnregister => {
                let Some(console) = &self.console else {
                    return self.violation("no console extension installed");
                };
                let Ok(sub) = packet.data_as::<EventSubscription>() else {
                    return self.violation("malformed EVENT.UNREGISTER payload");
                };
                console.handle_unregister(self.client_id, &sub.event_name);
                Dispatch::None
            }

            PacketKind::CommandRun => {
                let Some(console) = &self.console else {
                    return self.violation("no console extension installed");
                };
                let Ok(run) = packet.data_as::<CommandRun>() else {
                    return self.violation("malformed COMMAND.RUN payload");
                };
                console.spawn_command(self.client_id, run.command_line);
                Dispatch::None
            }

            PacketKind::ChannelJoin => {
                let Some(sync) = &self.sync else {
                    return self.violation("no sync extension installed");
                };
                let Ok(join) = packet.data_as::<ChannelJoin>() else {
                    return self.violation("malformed CHANNEL.JOIN payload");
                };
                Dispatch::Reply(sync.handle_join(self.client_id, join.channel_id))
            }

            PacketKind::StateUpdate => {
                let Some(sync) = &self.sync else {
                    return self.violation("no sync extension installed");
                };
                let Ok(update) = packet.data_as::<StateUpdate>() else {
                    return self.violation("malformed STATE.UPDATE payload");
                };
                if sync.handle_update(self.client_id, update).await {
                    Dispatch::None
                } else {
                    self.violation("STATE.UPDATE before CHANNEL.JOIN")
                }
            }

            // Server-to-client kinds; receiving one here is a violation
            PacketKind::AuthSuccess
            | PacketKind::EventLog
            | PacketKind::CommandResult
            | PacketKind::StateFull => self.violation("server-bound packet from peer"),
        }
    }

    fn violation(&self, reason: &str) -> Dispatch {
        debug!("{} protocol violation: {}", self.client_id, reason);
        Dispatch::Close
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::executor::{CommandExecutor, CommandOutcome, ExecuteResult};
    use crate::registry::Outgoing;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct EchoExecutor;

    #[async_trait::async_trait]
    impl CommandExecutor for EchoExecutor {
        async fn execute(&self, command_line: &str) -> ExecuteResult<CommandOutcome> {
            Ok(CommandOutcome::new(json!(command_line)))
        }
    }

    struct Fixture {
        registry: Arc<ClientRegistry>,
        console: Arc<ConsoleExtension>,
        sync: Arc<SyncExtension>,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(ClientRegistry::new());
            let console = Arc::new(ConsoleExtension::new(
                Arc::clone(&registry),
                "s3cr3t",
                Arc::new(EchoExecutor),
            ));
            let sync = Arc::new(SyncExtension::new(Arc::clone(&registry)));
            Self {
                registry,
                console,
                sync,
            }
        }

        fn context(&self) -> (HandlerContext, mpsc::Receiver<Outgoing>) {
            let (tx, rx) = mpsc::channel(10);
            let client_id = self.registry.register_client(tx);
            self.console.client_connected(client_id);
            (
                HandlerContext {
                    registry: Arc::clone(&self.registry),
                    console: Some(Arc::clone(&self.console)),
                    sync: Some(Arc::clone(&self.sync)),
                    client_id,
                },
                rx,
            )
        }
    }

    fn auth_packet(secret: &str) -> Packet {
        Packet::new(PacketKind::AuthRequest, json!({"secret": secret}))
    }

    #[tokio::test]
    async fn test_auth_success_replies() {
        let fixture = Fixture::new();
        let (ctx, _rx) = fixture.context();

        let result = ctx.route_packet(auth_packet("s3cr3t")).await;
        match result {
            Dispatch::Reply(packet) => assert_eq!(packet.kind, PacketKind::AuthSuccess),
            other => panic!("Expected Reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_auth_mismatch_closes_without_reply() {
        let fixture = Fixture::new();
        let (ctx, _rx) = fixture.context();

        let result = ctx.route_packet(auth_packet("wrong")).await;
        assert!(matches!(result, Dispatch::Close));
    }

    #[tokio::test]
    async fn test_malformed_auth_closes() {
        let fixture = Fixture::new();
        let (ctx, _rx) = fixture.context();

        let packet = Packet::new(PacketKind::AuthRequest, json!({"nope": true}));
        assert!(matches!(ctx.route_packet(packet).await, Dispatch::Close));
    }

    #[tokio::test]
    async fn test_unauthenticated_packets_close() {
        for kind_and_data in [
            (PacketKind::Keepalive, json!({})),
            (PacketKind::EventRegister, json!({"eventName": "LOG"})),
            (PacketKind::CommandRun, json!({"commandLine": "ls"})),
            (PacketKind::ChannelJoin, json!({"channelId": "c1"})),
            (PacketKind::StateUpdate, json!({"key": "x", "value": 1})),
        ] {
            let fixture = Fixture::new();
            let (ctx, _rx) = fixture.context();

            let packet = Packet::new(kind_and_data.0, kind_and_data.1);
            assert!(
                matches!(ctx.route_packet(packet).await, Dispatch::Close),
                "{} should close pre-auth",
                kind_and_data.0
            );
        }
    }

    #[tokio::test]
    async fn test_authenticated_flow() {
        let fixture = Fixture::new();
        let (ctx, mut rx) = fixture.context();

        assert!(matches!(
            ctx.route_packet(auth_packet("s3cr3t")).await,
            Dispatch::Reply(_)
        ));

        // Keepalive: silent
        let keepalive = Packet::empty(PacketKind::Keepalive);
        assert!(matches!(ctx.route_packet(keepalive).await, Dispatch::None));

        // Command runs on a spawned task, result arrives via the registry
        let run = Packet::new(PacketKind::CommandRun, json!({"commandLine": "echo hi"}));
        assert!(matches!(ctx.route_packet(run).await, Dispatch::None));

        let outgoing = rx.recv().await.unwrap();
        match outgoing {
            Outgoing::Packet(p) => assert_eq!(p.kind, PacketKind::CommandResult),
            other => panic!("Expected Packet, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_replies_with_snapshot() {
        let fixture = Fixture::new();
        let (ctx, _rx) = fixture.context();

        ctx.route_packet(auth_packet("s3cr3t")).await;

        let join = Packet::new(PacketKind::ChannelJoin, json!({"channelId": "c1"}));
        match ctx.route_packet(join).await {
            Dispatch::Reply(packet) => {
                assert_eq!(packet.kind, PacketKind::StateFull);
                assert_eq!(packet.data, json!({}));
            }
            other => panic!("Expected Reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_before_join_closes() {
        let fixture = Fixture::new();
        let (ctx, _rx) = fixture.context();

        ctx.route_packet(auth_packet("s3cr3t")).await;

        let update = Packet::new(PacketKind::StateUpdate, json!({"key": "x", "value": 1}));
        assert!(matches!(ctx.route_packet(update).await, Dispatch::Close));
    }

    #[tokio::test]
    async fn test_server_bound_kind_from_peer_closes() {
        let fixture = Fixture::new();
        let (ctx, _rx) = fixture.context();

        ctx.route_packet(auth_packet("s3cr3t")).await;

        for kind in [
            PacketKind::AuthSuccess,
            PacketKind::EventLog,
            PacketKind::CommandResult,
            PacketKind::StateFull,
        ] {
            let packet = Packet::empty(kind);
            assert!(
                matches!(ctx.route_packet(packet).await, Dispatch::Close),
                "{} from peer should close",
                kind
            );
        }
    }

    #[tokio::test]
    async fn test_sync_only_server_accepts_join_without_auth() {
        let registry = Arc::new(ClientRegistry::new());
        let sync = Arc::new(SyncExtension::new(Arc::clone(&registry)));
        let (tx, _rx) = mpsc::channel(10);
        let client_id = registry.register_client(tx);

        let ctx = HandlerContext {
            registry,
            console: None,
            sync: Some(sync),
            client_id,
        };

        let join = Packet::new(PacketKind::ChannelJoin, json!({"channelId": "c1"}));
        assert!(matches!(ctx.route_packet(join).await, Dispatch::Reply(_)));
    }

    #[tokio::test]
    async fn test_console_kind_without_console_closes() {
        let registry = Arc::new(ClientRegistry::new());
        let sync = Arc::new(SyncExtension::new(Arc::clone(&registry)));
        let (tx, _rx) = mpsc::channel(10);
        let client_id = registry.register_client(tx);

        let ctx = HandlerContext {
            registry,
            console: None,
            sync: Some(sync),
            client_id,
        };

        let run = Packet::new(PacketKind::CommandRun, json!({"commandLine": "ls"}));
        assert!(matches!(ctx.route_packet(run).await, Dispatch::Close));
    }
}
