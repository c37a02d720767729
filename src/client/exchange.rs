//! Pending exchange tracking.
//!
//! Every outstanding request or observation is indexed simultaneously
//! by token, by message ID and by normalized url; removal through any
//! path clears all three keys and cancels any retransmission timer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::ClientError;

use super::origin::Origin;
use super::CoapResponse;

/// Observation callbacks are invoked outside the pending-table lock, so
/// they live behind their own mutex.
pub(crate) type ObserveHandler = Arc<Mutex<dyn FnMut(CoapResponse) + Send>>;

/// Where a matching inbound response goes: a one-shot result slot for
/// `request`, or a persistent callback for `observe`.
pub(crate) enum ResponseSink {
    Once(Option<oneshot::Sender<Result<CoapResponse, ClientError>>>),
    Observe(ObserveHandler),
}

/// Backoff state of an in-flight confirmable message.
pub(crate) struct RetransmitState {
    pub(crate) timeout: Duration,
    pub(crate) attempts: u32,
    timer: Option<JoinHandle<()>>,
}

impl RetransmitState {
    pub(crate) fn new(timeout: Duration) -> RetransmitState {
        RetransmitState {
            timeout,
            attempts: 0,
            timer: None,
        }
    }

    pub(crate) fn set_timer(&mut self, handle: JoinHandle<()>) {
        self.timer = Some(handle);
    }

    /// Idempotent; cancelling an already fired or cancelled timer is a
    /// no-op.
    pub(crate) fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

pub(crate) struct PendingExchange {
    pub(crate) origin: Origin,
    pub(crate) url: String,
    pub(crate) message_id: u16,
    pub(crate) token: Vec<u8>,
    /// The exact serialized message, kept verbatim for retransmission.
    pub(crate) datagram: Vec<u8>,
    pub(crate) retransmit: Option<RetransmitState>,
    pub(crate) sink: ResponseSink,
    pub(crate) keep_alive: bool,
}

impl PendingExchange {
    pub(crate) fn is_observation(&self) -> bool {
        matches!(self.sink, ResponseSink::Observe(_))
    }

    /// Stop any pending retransmission without removing the exchange.
    pub(crate) fn stop_retransmit(&mut self) {
        if let Some(state) = self.retransmit.as_mut() {
            state.cancel();
        }
        self.retransmit = None;
    }

    pub(crate) fn complete(mut self, response: CoapResponse) {
        self.stop_retransmit();
        if let ResponseSink::Once(sender) = &mut self.sink {
            if let Some(sender) = sender.take() {
                let _ = sender.send(Ok(response));
            }
        }
    }

    pub(crate) fn fail(mut self, error: ClientError) {
        self.stop_retransmit();
        if let ResponseSink::Once(sender) = &mut self.sink {
            if let Some(sender) = sender.take() {
                let _ = sender.send(Err(error));
            }
        }
    }
}

impl Drop for PendingExchange {
    fn drop(&mut self) {
        self.stop_retransmit();
    }
}

/// The three lookup keys over the same set of exchanges.
#[derive(Default)]
pub(crate) struct PendingTable {
    by_token: HashMap<Vec<u8>, PendingExchange>,
    by_message_id: HashMap<u16, Vec<u8>>,
    by_url: HashMap<String, Vec<u8>>,
}

impl PendingTable {
    /// Only observations bind their normalized url, so one-shot
    /// requests to an observed url can never steal the subscription's
    /// cancellation key. Re-registering a url replaces the previous
    /// subscription.
    pub(crate) fn insert(&mut self, exchange: PendingExchange) {
        self.by_message_id
            .insert(exchange.message_id, exchange.token.clone());
        if exchange.is_observation() {
            if let Some(stale) = self
                .by_url
                .insert(exchange.url.clone(), exchange.token.clone())
            {
                if stale != exchange.token {
                    let _ = self.remove(&stale);
                }
            }
        }
        self.by_token.insert(exchange.token.clone(), exchange);
    }

    pub(crate) fn get_mut(&mut self, token: &[u8]) -> Option<&mut PendingExchange> {
        self.by_token.get_mut(token)
    }

    pub(crate) fn token_for_message_id(&self, message_id: u16) -> Option<Vec<u8>> {
        self.by_message_id.get(&message_id).cloned()
    }

    pub(crate) fn token_for_url(&self, url: &str) -> Option<Vec<u8>> {
        self.by_url.get(url).cloned()
    }

    /// Remove from all three tables and cancel any retransmission
    /// timer. Secondary keys are only cleared when they still point at
    /// this token.
    pub(crate) fn remove(&mut self, token: &[u8]) -> Option<PendingExchange> {
        let mut exchange = self.by_token.remove(token)?;
        if self.by_message_id.get(&exchange.message_id).map(Vec::as_slice) == Some(token) {
            self.by_message_id.remove(&exchange.message_id);
        }
        if self.by_url.get(&exchange.url).map(Vec::as_slice) == Some(token) {
            self.by_url.remove(&exchange.url);
        }
        exchange.stop_retransmit();
        Some(exchange)
    }

    pub(crate) fn drain(&mut self) -> Vec<PendingExchange> {
        self.by_message_id.clear();
        self.by_url.clear();
        self.by_token.drain().map(|(_, ex)| ex).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::origin::CoapUrl;

    fn exchange(url: &str, message_id: u16, token: Vec<u8>, sink: ResponseSink) -> PendingExchange {
        let parsed = CoapUrl::parse(url).unwrap();
        PendingExchange {
            origin: parsed.origin.clone(),
            url: parsed.normalized(),
            message_id,
            token,
            datagram: vec![],
            retransmit: None,
            sink,
            keep_alive: true,
        }
    }

    fn observation(url: &str, message_id: u16, token: Vec<u8>) -> PendingExchange {
        let handler: ObserveHandler = Arc::new(Mutex::new(|_: CoapResponse| {}));
        exchange(url, message_id, token, ResponseSink::Observe(handler))
    }

    fn one_shot(url: &str, message_id: u16, token: Vec<u8>) -> PendingExchange {
        exchange(url, message_id, token, ResponseSink::Once(None))
    }

    #[test]
    fn test_remove_clears_all_keys() {
        let mut table = PendingTable::default();
        let ex = observation("coap://h/a", 7, vec![1, 2, 3, 4]);
        let url = ex.url.clone();
        table.insert(ex);

        assert!(table.get_mut(&[1, 2, 3, 4]).is_some());
        assert_eq!(table.token_for_message_id(7), Some(vec![1, 2, 3, 4]));
        assert_eq!(table.token_for_url(&url), Some(vec![1, 2, 3, 4]));

        assert!(table.remove(&[1, 2, 3, 4]).is_some());
        assert!(table.get_mut(&[1, 2, 3, 4]).is_none());
        assert!(table.token_for_message_id(7).is_none());
        assert!(table.token_for_url(&url).is_none());

        assert!(table.remove(&[1, 2, 3, 4]).is_none());
    }

    #[test]
    fn test_one_shot_never_claims_url_key() {
        let mut table = PendingTable::default();
        let url = CoapUrl::parse("coap://h/a").unwrap().normalized();
        table.insert(observation("coap://h/a", 1, vec![1]));
        table.insert(one_shot("coap://h/a", 2, vec![9]));

        // the subscription stays reachable through the url while the
        // one-shot lives and after it completes
        assert_eq!(table.token_for_url(&url), Some(vec![1]));
        assert!(table.remove(&[9]).is_some());
        assert_eq!(table.token_for_url(&url), Some(vec![1]));
        assert!(table.get_mut(&[1]).is_some());
    }

    #[test]
    fn test_reobserve_replaces_previous_subscription() {
        let mut table = PendingTable::default();
        table.insert(observation("coap://h/a", 1, vec![1]));
        table.insert(observation("coap://h/a", 2, vec![2]));

        let url = CoapUrl::parse("coap://h/a").unwrap().normalized();
        assert_eq!(table.token_for_url(&url), Some(vec![2]));
        // the first subscription is gone from every table, not orphaned
        assert!(table.get_mut(&[1]).is_none());
        assert!(table.token_for_message_id(1).is_none());
        assert_eq!(table.token_for_message_id(2), Some(vec![2]));
    }

    #[test]
    fn test_retransmit_cancel_is_idempotent() {
        let mut state = RetransmitState::new(Duration::from_secs(2));
        state.cancel();
        state.cancel();
        assert_eq!(state.attempts, 0);
    }
}
