//! Message dispatcher: routes decoded frames to the handler registered for
//! their uid.
//!
//! Handlers never capture engine state. Each call gets a [`HandlerContext`]
//! borrowing the mirror and the subscription machinery for the duration of
//! one frame, so frames are applied strictly one after another.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::cascade::CascadeResolver;
use crate::engine::SyncEvent;
use crate::mirror::MirrorStore;
use crate::protocol::{InboundFrame, OutboundFrame, ProtocolError, SubscriptionEvent};
use crate::registry::SubscriptionRegistry;
use crate::transport::FrameSink;

/// Reaction to the events of one subscription.
pub trait SubscriptionHandler: Send + Sync {
    fn handle(&self, event: &SubscriptionEvent, ctx: &mut HandlerContext<'_>);
}

/// Everything a handler may touch while processing one event.
pub struct HandlerContext<'a> {
    pub mirror: &'a mut MirrorStore,
    pub registry: &'a mut SubscriptionRegistry,
    pub cascade: &'a mut CascadeResolver,
    pub sink: &'a dyn FrameSink,
    /// Change notifications collected for the engine's listeners.
    pub events: &'a mut Vec<SyncEvent>,
}

/// What happened to one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Delivered to the handler registered for this uid.
    Routed(String),
    /// Keepalive answered.
    Ponged,
    /// Not forwarded; the reason has been logged.
    Dropped,
}

/// Frame counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub routed: u64,
    pub dropped: u64,
    pub pongs: u64,
    pub errors: u64,
}

#[derive(Default)]
pub struct Dispatcher {
    stats: DispatchStats,
    waiters: HashMap<String, Vec<oneshot::Sender<()>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one text frame and dispatch it.
    ///
    /// Malformed JSON is returned to the caller. Frames that decode but are
    /// unusable are logged and dropped.
    pub fn dispatch_text(
        &mut self,
        text: &str,
        ctx: &mut HandlerContext<'_>,
    ) -> Result<Dispatch, ProtocolError> {
        match InboundFrame::decode(text) {
            Ok(frame) => Ok(self.dispatch(frame, ctx)),
            Err(ProtocolError::InvalidFrame(reason)) => {
                log::warn!("[WS] dropping invalid frame: {reason}");
                self.stats.dropped += 1;
                Ok(Dispatch::Dropped)
            }
            Err(e) => {
                self.stats.errors += 1;
                Err(e)
            }
        }
    }

    /// Dispatch one validated frame.
    pub fn dispatch(&mut self, frame: InboundFrame, ctx: &mut HandlerContext<'_>) -> Dispatch {
        match frame {
            InboundFrame::Ping => {
                ctx.sink.send(&OutboundFrame::pong());
                self.stats.pongs += 1;
                Dispatch::Ponged
            }
            InboundFrame::Pong => Dispatch::Dropped,
            InboundFrame::ErrorNotice { uid, message } => {
                match uid {
                    Some(uid) => log::error!("[WS] server error for {uid}: {message}"),
                    None => log::error!("[WS] server error: {message}"),
                }
                self.stats.errors += 1;
                Dispatch::Dropped
            }
            InboundFrame::Unsupported { kind } => {
                log::debug!("[WS] ignoring '{kind}' frame");
                self.stats.dropped += 1;
                Dispatch::Dropped
            }
            InboundFrame::Event(event) => self.route(event, ctx),
        }
    }

    fn route(&mut self, event: SubscriptionEvent, ctx: &mut HandlerContext<'_>) -> Dispatch {
        let Some(entry) = ctx.registry.get_mut(&event.uid) else {
            log::warn!("[WS] no subscription for uid {}", event.uid);
            self.stats.dropped += 1;
            return Dispatch::Dropped;
        };
        entry.events_received += 1;
        let handler = entry.handler();

        log::debug!("[WS] {} event for {}", event.kind.as_str(), event.uid);
        handler.handle(&event, ctx);
        self.stats.routed += 1;

        if let Some(waiters) = self.waiters.remove(&event.uid) {
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
        Dispatch::Routed(event.uid)
    }

    /// Receiver that fires when the first event for `uid` arrives.
    ///
    /// Fires right away when `uid` has already seen an event. The sender is
    /// dropped (and the wait fails) when the dispatcher is reset.
    pub fn expect_first_event(
        &mut self,
        uid: &str,
        registry: &SubscriptionRegistry,
    ) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let seen = registry
            .get(uid)
            .is_some_and(|entry| entry.events_received > 0);
        if seen {
            let _ = tx.send(());
        } else {
            let waiters = self.waiters.entry(uid.to_string()).or_default();
            // Receivers of timed-out waits are gone.
            waiters.retain(|waiter| !waiter.is_closed());
            waiters.push(tx);
        }
        rx
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Drop every pending waiter.
    pub fn reset(&mut self) {
        self.waiters.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::protocol::EventKind;
    use crate::transport::test_support::RecordingSink;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, EventKind, usize)>>,
    }

    impl SubscriptionHandler for Recorder {
        fn handle(&self, event: &SubscriptionEvent, _ctx: &mut HandlerContext<'_>) {
            self.seen
                .lock()
                .push((event.uid.clone(), event.kind, event.data.len()));
        }
    }

    struct Fixture {
        sink: RecordingSink,
        mirror: MirrorStore,
        registry: SubscriptionRegistry,
        cascade: CascadeResolver,
        events: Vec<SyncEvent>,
        dispatcher: Dispatcher,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                sink: RecordingSink::default(),
                mirror: MirrorStore::new(),
                registry: SubscriptionRegistry::new(),
                cascade: CascadeResolver::new(),
                events: Vec::new(),
                dispatcher: Dispatcher::new(),
            }
        }

        fn feed(&mut self, text: &str) -> Result<Dispatch, ProtocolError> {
            let mut ctx = HandlerContext {
                mirror: &mut self.mirror,
                registry: &mut self.registry,
                cascade: &mut self.cascade,
                sink: &self.sink,
                events: &mut self.events,
            };
            self.dispatcher.dispatch_text(text, &mut ctx)
        }
    }

    #[test]
    fn test_ping_answers_one_pong_without_handler() {
        let mut fx = Fixture::new();
        let recorder = Arc::new(Recorder::default());
        fx.registry
            .subscribe_item(&fx.sink, "tiles", "t1", None, recorder.clone());
        fx.sink.take();

        assert_eq!(fx.feed(r#"{"type":"ping"}"#).unwrap(), Dispatch::Ponged);

        assert_eq!(fx.sink.frames(), vec![OutboundFrame::pong()]);
        assert!(recorder.seen.lock().is_empty());
        assert_eq!(fx.dispatcher.stats().pongs, 1);
    }

    #[test]
    fn test_event_routed_by_uid() {
        let mut fx = Fixture::new();
        let recorder = Arc::new(Recorder::default());
        fx.registry
            .subscribe_item(&fx.sink, "tiles", "t1", None, recorder.clone());

        let outcome = fx
            .feed(r#"{"type":"subscription","uid":"tiles:t1","event":"update","data":[{"id":"t1"}]}"#)
            .unwrap();

        assert_eq!(outcome, Dispatch::Routed("tiles:t1".into()));
        assert_eq!(
            *recorder.seen.lock(),
            vec![("tiles:t1".to_string(), EventKind::Update, 1)]
        );
        assert_eq!(fx.registry.get("tiles:t1").unwrap().events_received, 1);
    }

    #[test]
    fn test_unknown_uid_is_dropped() {
        let mut fx = Fixture::new();
        let outcome = fx
            .feed(r#"{"type":"subscription","uid":"ghost","event":"create","data":[]}"#)
            .unwrap();
        assert_eq!(outcome, Dispatch::Dropped);
        assert_eq!(fx.dispatcher.stats().dropped, 1);
    }

    #[test]
    fn test_error_frame_is_not_forwarded() {
        let mut fx = Fixture::new();
        let recorder = Arc::new(Recorder::default());
        fx.registry
            .subscribe_item(&fx.sink, "tiles", "t1", None, recorder.clone());

        let outcome = fx
            .feed(r#"{"type":"subscription","uid":"tiles:t1","event":"error","error":{"message":"Forbidden"}}"#)
            .unwrap();

        assert_eq!(outcome, Dispatch::Dropped);
        assert!(recorder.seen.lock().is_empty());
        assert_eq!(fx.dispatcher.stats().errors, 1);
    }

    #[test]
    fn test_malformed_json_propagates() {
        let mut fx = Fixture::new();
        assert!(matches!(fx.feed("{not json"), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_invalid_shape_is_dropped() {
        let mut fx = Fixture::new();
        assert_eq!(
            fx.feed(r#"{"type":"subscription","event":"create"}"#).unwrap(),
            Dispatch::Dropped
        );
    }

    #[tokio::test]
    async fn test_first_event_waiter_fires() {
        let mut fx = Fixture::new();
        fx.registry.subscribe_item(
            &fx.sink,
            "tiles",
            "t1",
            None,
            Arc::new(Recorder::default()),
        );
        let rx = fx.dispatcher.expect_first_event("tiles:t1", &fx.registry);

        fx.feed(r#"{"type":"subscription","uid":"tiles:t1","event":"init","data":[]}"#)
            .unwrap();

        assert!(rx.await.is_ok());
        // Later callers are answered immediately.
        let again = fx.dispatcher.expect_first_event("tiles:t1", &fx.registry);
        assert!(again.await.is_ok());
    }

    #[test]
    fn test_abandoned_waiters_are_pruned() {
        let mut fx = Fixture::new();
        for _ in 0..5 {
            drop(fx.dispatcher.expect_first_event("tiles:quiet", &fx.registry));
        }
        let _live = fx.dispatcher.expect_first_event("tiles:quiet", &fx.registry);

        assert_eq!(fx.dispatcher.waiters["tiles:quiet"].len(), 1);
    }

    #[tokio::test]
    async fn test_reset_fails_waiters() {
        let mut fx = Fixture::new();
        let rx = fx.dispatcher.expect_first_event("batches-current", &fx.registry);
        fx.dispatcher.reset();
        assert!(rx.await.is_err());
    }
}
