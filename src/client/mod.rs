//! The client exchange engine.
//!
//! One `CoAPClient` owns a lazily built connection table (one entry per
//! origin), the pending-exchange tables and the security-parameter
//! registry. Requests and observations share one issuance path; inbound
//! datagrams are parsed by the codec and correlated back here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::join_all;
use log::{debug, trace, warn};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::time;

use crate::error::{ClientError, OptionError};
use crate::message::header::{MessageClass, MessageType, RequestType};
use crate::message::option::{codes, CoapOption};
use crate::message::packet::{ContentFormat, ObserveOption, Packet};
use crate::transport::{ClientTransport, UdpTransport, COAP_MTU};

mod connection;
mod exchange;
pub mod origin;

use connection::Connection;
use exchange::{ObserveHandler, PendingExchange, PendingTable, ResponseSink, RetransmitState};
use origin::{CoapUrl, Origin, Scheme};

#[cfg(feature = "dtls")]
const DTLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Options for one request or observation.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptions {
    /// Send as a confirmable message with retransmission.
    pub confirmable: bool,
    /// Keep the origin's connection open after a one-shot exchange
    /// completes.
    pub keep_alive: bool,
    pub content_format: Option<ContentFormat>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            confirmable: true,
            keep_alive: true,
            content_format: None,
        }
    }
}

/// RFC 7252 §4.8 transmission parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransmissionParameters {
    pub ack_timeout: Duration,
    pub ack_random_factor: f64,
    pub max_retransmit: u32,
}

impl Default for TransmissionParameters {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
        }
    }
}

impl TransmissionParameters {
    /// Randomized within [ack_timeout, ack_timeout * ack_random_factor].
    fn initial_timeout(&self) -> Duration {
        let jitter = 1.0 + rand::random::<f64>() * (self.ack_random_factor - 1.0);
        let ms = (self.ack_timeout.as_millis() as f64 * jitter).round();
        Duration::from_millis(ms as u64)
    }
}

/// Pre-shared-key material for one hostname: identity to key pairs.
#[derive(Debug, Clone, Default)]
pub struct SecurityParameters {
    keys: Vec<(Vec<u8>, Vec<u8>)>,
}

impl SecurityParameters {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add_key(&mut self, identity: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) {
        self.keys.push((identity.into(), key.into()));
    }

    #[cfg(feature = "dtls")]
    pub(crate) fn identity(&self) -> Option<&[u8]> {
        self.keys.first().map(|(identity, _)| identity.as_slice())
    }

    /// Key for the peer's identity hint, falling back to the first
    /// registered key.
    #[cfg(feature = "dtls")]
    pub(crate) fn key_for(&self, hint: &[u8]) -> Option<Vec<u8>> {
        self.keys
            .iter()
            .find(|(identity, _)| identity == hint)
            .or_else(|| self.keys.first())
            .map(|(_, key)| key.clone())
    }
}

/// The caller-visible outcome of an exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct CoapResponse {
    pub code: MessageClass,
    pub content_format: Option<ContentFormat>,
    pub payload: Vec<u8>,
}

impl CoapResponse {
    fn from_packet(packet: &Packet) -> CoapResponse {
        CoapResponse {
            code: packet.header.code,
            content_format: packet.get_content_format(),
            payload: packet.payload.clone(),
        }
    }
}

/// An asynchronous CoAP client.
#[derive(Clone)]
pub struct CoAPClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    connections: AsyncMutex<HashMap<Origin, Arc<Connection>>>,
    pending: StdMutex<PendingTable>,
    security: StdMutex<HashMap<String, SecurityParameters>>,
    params: TransmissionParameters,
}

impl Default for CoAPClient {
    fn default() -> Self {
        Self::new()
    }
}

impl CoAPClient {
    pub fn new() -> CoAPClient {
        Self::with_parameters(Default::default())
    }

    pub fn with_parameters(params: TransmissionParameters) -> CoAPClient {
        CoAPClient {
            inner: Arc::new(ClientInner {
                connections: AsyncMutex::new(HashMap::new()),
                pending: StdMutex::new(PendingTable::default()),
                security: StdMutex::new(HashMap::new()),
                params,
            }),
        }
    }

    /// Register pre-shared-key material for a hostname. Consulted only
    /// when a `coaps` connection to that hostname is established.
    pub fn set_security_parameters(&self, hostname: &str, params: SecurityParameters) {
        self.inner
            .security
            .lock()
            .unwrap()
            .insert(hostname.to_lowercase(), params);
    }

    /// Issue a request and await its response.
    pub async fn request(
        &self,
        url: &str,
        method: RequestType,
        payload: Option<Vec<u8>>,
        options: RequestOptions,
    ) -> Result<CoapResponse, ClientError> {
        let receiver = self
            .inner
            .issue(url, method, payload, options, None)
            .await?
            .expect("one-shot issuance always yields a receiver");
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Cancelled),
        }
    }

    pub async fn get(&self, url: &str) -> Result<CoapResponse, ClientError> {
        self.request(url, RequestType::Get, None, Default::default())
            .await
    }

    pub async fn post(&self, url: &str, payload: Vec<u8>) -> Result<CoapResponse, ClientError> {
        self.request(url, RequestType::Post, Some(payload), Default::default())
            .await
    }

    pub async fn put(&self, url: &str, payload: Vec<u8>) -> Result<CoapResponse, ClientError> {
        self.request(url, RequestType::Put, Some(payload), Default::default())
            .await
    }

    pub async fn delete(&self, url: &str) -> Result<CoapResponse, ClientError> {
        self.request(url, RequestType::Delete, None, Default::default())
            .await
    }

    /// Subscribe to a resource. Every matching notification invokes the
    /// handler until `stop_observing` removes the subscription.
    pub async fn observe<H: FnMut(CoapResponse) + Send + 'static>(
        &self,
        url: &str,
        method: RequestType,
        handler: H,
        payload: Option<Vec<u8>>,
        options: RequestOptions,
    ) -> Result<(), ClientError> {
        let handler: ObserveHandler = Arc::new(StdMutex::new(handler));
        self.inner
            .issue(url, method, payload, options, Some(handler))
            .await?;
        Ok(())
    }

    /// Silent local unsubscribe: the exchange is forgotten, and a stale
    /// notification from the peer is answered with RST.
    pub fn stop_observing(&self, url: &str) -> Result<(), ClientError> {
        let target = CoapUrl::parse(url)?;
        let normalized = target.normalized();
        let removed = {
            let mut pending = self.inner.pending.lock().unwrap();
            pending
                .token_for_url(&normalized)
                .and_then(|token| pending.remove(&token))
        };
        if let Some(exchange) = removed {
            debug!("stopped observing {}", exchange.url);
        }
        Ok(())
    }

    /// Tear down all connections and cancel every pending exchange.
    pub async fn close(&self) {
        let connections: Vec<_> = {
            let mut table = self.inner.connections.lock().await;
            table.drain().map(|(_, conn)| conn).collect()
        };
        join_all(connections.iter().map(|conn| conn.shutdown())).await;
        let drained = self.inner.pending.lock().unwrap().drain();
        for exchange in drained {
            debug!("cancelling exchange with {}", exchange.origin.host);
            exchange.fail(ClientError::Cancelled);
        }
    }
}

fn option_err(err: OptionError) -> ClientError {
    ClientError::Parse(err.into())
}

impl ClientInner {
    /// Shared issuance path for `request` and `observe`. Returns the
    /// result receiver for one-shot exchanges.
    async fn issue(
        self: &Arc<Self>,
        url: &str,
        method: RequestType,
        payload: Option<Vec<u8>>,
        options: RequestOptions,
        observer: Option<ObserveHandler>,
    ) -> Result<Option<oneshot::Receiver<Result<CoapResponse, ClientError>>>, ClientError> {
        let target = CoapUrl::parse(url)?;
        let conn = self.connection(&target.origin).await?;
        let (message_id, token) = conn.allocate();

        let mut packet = Packet::new();
        packet.header.set_version(1);
        packet.header.set_type(if options.confirmable {
            MessageType::Confirmable
        } else {
            MessageType::NonConfirmable
        });
        packet.header.code = MessageClass::Request(method);
        packet.header.set_message_id(message_id);
        packet.set_token(token.clone());

        for segment in target.path_segments() {
            packet.add_option(CoapOption::string(codes::URI_PATH, segment).map_err(option_err)?);
        }
        if let Some(query) = &target.query {
            for part in query.split('&').filter(|s| !s.is_empty()) {
                packet.add_option(CoapOption::string(codes::URI_QUERY, part).map_err(option_err)?);
            }
        }
        if let Some(cf) = options.content_format {
            packet.set_content_format(cf);
        }
        if observer.is_some() {
            packet
                .set_observe(ObserveOption::Register as u64)
                .map_err(option_err)?;
        }
        if let Some(payload) = payload {
            packet.payload = payload;
        }

        let datagram = packet.to_bytes();

        let (sink, receiver) = match observer {
            Some(handler) => (ResponseSink::Observe(handler), None),
            None => {
                let (tx, rx) = oneshot::channel();
                (ResponseSink::Once(Some(tx)), Some(rx))
            }
        };

        let mut exchange = PendingExchange {
            origin: target.origin.clone(),
            url: target.normalized(),
            message_id,
            token: token.clone(),
            datagram: datagram.clone(),
            retransmit: None,
            sink,
            keep_alive: options.keep_alive,
        };
        if options.confirmable {
            exchange.retransmit = Some(RetransmitState::new(self.params.initial_timeout()));
        }

        {
            let mut pending = self.pending.lock().unwrap();
            pending.insert(exchange);
            if options.confirmable {
                let timer = self.spawn_retransmit(conn.clone(), token.clone());
                if let Some(ex) = pending.get_mut(&token) {
                    if let Some(state) = ex.retransmit.as_mut() {
                        state.set_timer(timer);
                    }
                }
            }
        }

        trace!("transmit {} bytes to {}", datagram.len(), target.origin.host);
        if let Err(err) = conn.transport.send(&datagram).await {
            self.pending.lock().unwrap().remove(&token);
            return Err(err.into());
        }
        Ok(receiver)
    }

    /// Look up or lazily establish the connection for an origin. The
    /// table lock is not held during transport setup, so concurrent
    /// issuance to other origins is never blocked by a slow handshake.
    async fn connection(self: &Arc<Self>, origin: &Origin) -> Result<Arc<Connection>, ClientError> {
        if let Some(conn) = self.connections.lock().await.get(origin) {
            return Ok(conn.clone());
        }

        let transport = self.establish(origin).await?;

        let mut connections = self.connections.lock().await;
        if let Some(conn) = connections.get(origin) {
            // lost the establishment race; keep the existing one
            let _ = transport.close().await;
            return Ok(conn.clone());
        }

        let conn = Arc::new(Connection::new(origin.clone(), transport.clone()));
        let reader = tokio::spawn(Self::read_loop(self.clone(), transport, origin.clone()));
        conn.set_reader(reader);
        connections.insert(origin.clone(), conn.clone());
        Ok(conn)
    }

    async fn establish(&self, origin: &Origin) -> Result<Arc<dyn ClientTransport>, ClientError> {
        match origin.scheme {
            Scheme::Coap => Ok(Arc::new(
                UdpTransport::connect(&origin.host, origin.port).await?,
            )),
            #[cfg(feature = "dtls")]
            Scheme::Coaps => {
                let params = self
                    .security
                    .lock()
                    .unwrap()
                    .get(&origin.host)
                    .cloned()
                    .ok_or_else(|| ClientError::NoSecurityParameters(origin.host.clone()))?;
                let addr = crate::transport::resolve(&origin.host, origin.port).await?;
                let config = crate::dtls::psk_config(&origin.host, &params);
                Ok(Arc::new(
                    crate::dtls::DtlsConnection::connect(addr, config, DTLS_HANDSHAKE_TIMEOUT)
                        .await?,
                ))
            }
            #[cfg(not(feature = "dtls"))]
            Scheme::Coaps => Err(ClientError::UnsupportedProtocol("coaps".to_string())),
        }
    }

    async fn read_loop(inner: Arc<ClientInner>, transport: Arc<dyn ClientTransport>, origin: Origin) {
        let mut buf = vec![0u8; COAP_MTU];
        loop {
            match transport.recv(&mut buf).await {
                Ok(n) => {
                    trace!("received {} bytes from {}", n, origin.host);
                    // a decode failure is fatal only to this datagram
                    match Packet::from_bytes(&buf[..n]) {
                        Ok(packet) => inner.dispatch(packet, &origin).await,
                        Err(err) => {
                            warn!("dropping malformed datagram from {}: {}", origin.host, err)
                        }
                    }
                }
                Err(err) => {
                    debug!("receive failed for {}: {}", origin.host, err);
                    return;
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, packet: Packet, origin: &Origin) {
        let code = packet.header.code;
        let message_id = packet.header.get_message_id();

        if code.is_empty() {
            match packet.header.get_type() {
                MessageType::Acknowledgement => {
                    let mut pending = self.pending.lock().unwrap();
                    if let Some(token) = pending.token_for_message_id(message_id) {
                        if let Some(exchange) = pending.get_mut(&token) {
                            // a message id only counts against its own peer
                            if exchange.origin == *origin {
                                debug!("ack for message {}", message_id);
                                exchange.stop_retransmit();
                            }
                        }
                    }
                }
                MessageType::Reset => {
                    let removed = {
                        let mut pending = self.pending.lock().unwrap();
                        match pending.token_for_message_id(message_id) {
                            Some(token)
                                if pending
                                    .get_mut(&token)
                                    .map_or(false, |ex| ex.origin == *origin) =>
                            {
                                pending.remove(&token)
                            }
                            _ => None,
                        }
                    };
                    if let Some(exchange) = removed {
                        debug!("peer reset message {}", message_id);
                        exchange.fail(ClientError::PeerReset);
                    }
                }
                _ => {}
            }
            return;
        }

        if code.is_request() {
            // a client never serves requests
            debug!("discarding request-class message from {}", origin.host);
            return;
        }

        if !code.is_response() || packet.get_token().is_empty() {
            debug!("ignoring unmatchable message {} from {}", code, origin.host);
            return;
        }

        let token = packet.get_token().to_vec();
        let inbound_type = packet.header.get_type();
        let response = CoapResponse::from_packet(&packet);

        enum Match {
            Observation(ObserveHandler),
            OneShot(PendingExchange),
            Unknown,
        }

        let matched = {
            let mut pending = self.pending.lock().unwrap();
            let observer = match pending.get_mut(&token) {
                // a token is only meaningful against the origin it was
                // issued to; a coincidental match from another peer is
                // an unknown token
                Some(exchange) if exchange.origin == *origin => {
                    // an ACK carrying the response also acknowledges it
                    if inbound_type == MessageType::Acknowledgement {
                        exchange.stop_retransmit();
                    }
                    match &exchange.sink {
                        ResponseSink::Observe(handler) => Some(Some(handler.clone())),
                        ResponseSink::Once(_) => Some(None),
                    }
                }
                _ => None,
            };
            match observer {
                None => Match::Unknown,
                Some(Some(handler)) => Match::Observation(handler),
                Some(None) => match pending.remove(&token) {
                    Some(exchange) => Match::OneShot(exchange),
                    None => Match::Unknown,
                },
            }
        };

        match matched {
            Match::Observation(handler) => {
                trace!("notification for token {:?}", token);
                (handler.lock().unwrap())(response);
                if inbound_type == MessageType::Confirmable {
                    self.send_empty(origin, MessageType::Acknowledgement, message_id)
                        .await;
                }
            }
            Match::OneShot(exchange) => {
                let keep_alive = exchange.keep_alive;
                exchange.complete(response);
                if inbound_type == MessageType::Confirmable {
                    self.send_empty(origin, MessageType::Acknowledgement, message_id)
                        .await;
                }
                if !keep_alive {
                    self.spawn_teardown(origin.clone());
                }
            }
            Match::Unknown => {
                // tell the peer to stop sending; covers stale observe
                // notifications after stop_observing
                debug!("unknown token from {}, sending reset", origin.host);
                self.send_empty(origin, MessageType::Reset, message_id).await;
            }
        }
    }

    /// Send an empty-code ACK or RST echoing `message_id`, if a
    /// connection for the peer exists.
    async fn send_empty(&self, origin: &Origin, kind: MessageType, message_id: u16) {
        let conn = self.connections.lock().await.get(origin).cloned();
        let Some(conn) = conn else { return };

        let mut packet = Packet::new();
        packet.header.set_version(1);
        packet.header.set_type(kind);
        packet.header.set_message_id(message_id);

        if let Err(err) = conn.transport.send(&packet.to_bytes()).await {
            warn!("failed to send {:?} to {}: {}", kind, origin.host, err);
        }
    }

    /// One timer task per in-flight confirmable exchange.
    fn spawn_retransmit(
        self: &Arc<Self>,
        conn: Arc<Connection>,
        token: Vec<u8>,
    ) -> tokio::task::JoinHandle<()> {
        let inner = self.clone();
        tokio::spawn(async move {
            loop {
                let delay = {
                    let mut pending = inner.pending.lock().unwrap();
                    pending
                        .get_mut(&token)
                        .and_then(|ex| ex.retransmit.as_ref())
                        .map(|state| state.timeout)
                };
                let Some(delay) = delay else { return };
                time::sleep(delay).await;

                enum Fire {
                    Resend(Vec<u8>),
                    GiveUp,
                    Stop,
                }

                let action = {
                    let mut pending = inner.pending.lock().unwrap();
                    match pending.get_mut(&token) {
                        None => Fire::Stop,
                        Some(exchange) => match exchange.retransmit.as_mut() {
                            None => Fire::Stop,
                            Some(state) if state.attempts >= inner.params.max_retransmit => {
                                Fire::GiveUp
                            }
                            Some(state) => {
                                state.attempts += 1;
                                state.timeout *= 2;
                                Fire::Resend(exchange.datagram.clone())
                            }
                        },
                    }
                };

                match action {
                    Fire::Stop => return,
                    Fire::GiveUp => {
                        warn!("retransmission exhausted for {}", conn.origin.host);
                        let removed = inner.pending.lock().unwrap().remove(&token);
                        if let Some(exchange) = removed {
                            exchange.fail(ClientError::RetransmissionExhausted);
                        }
                        return;
                    }
                    Fire::Resend(datagram) => {
                        debug!("retransmitting {} bytes to {}", datagram.len(), conn.origin.host);
                        if let Err(err) = conn.transport.send(&datagram).await {
                            warn!("retransmit failed for {}: {}", conn.origin.host, err);
                        }
                    }
                }
            }
        })
    }

    fn spawn_teardown(self: &Arc<Self>, origin: Origin) {
        let inner = self.clone();
        tokio::spawn(async move {
            let conn = inner.connections.lock().await.remove(&origin);
            if let Some(conn) = conn {
                conn.shutdown().await;
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::header::ResponseType;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::UdpSocket;
    use tokio::time::{sleep, timeout};

    struct TestPeer {
        socket: UdpSocket,
    }

    impl TestPeer {
        async fn bind() -> (TestPeer, u16) {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let port = socket.local_addr().unwrap().port();
            (TestPeer { socket }, port)
        }

        async fn recv(&self) -> (Packet, SocketAddr) {
            let mut buf = [0u8; COAP_MTU];
            let (n, src) = self.socket.recv_from(&mut buf).await.unwrap();
            (Packet::from_bytes(&buf[..n]).unwrap(), src)
        }

        async fn recv_within(&self, dur: Duration) -> Option<(Packet, SocketAddr)> {
            timeout(dur, self.recv()).await.ok()
        }

        async fn send(&self, packet: &Packet, to: SocketAddr) {
            self.socket.send_to(&packet.to_bytes(), to).await.unwrap();
        }

        fn response_to(request: &Packet, msg_type: MessageType, payload: &[u8]) -> Packet {
            let mut packet = Packet::new();
            packet.header.set_version(1);
            packet.header.set_type(msg_type);
            packet.header.code = MessageClass::Response(ResponseType::Content);
            packet.header.set_message_id(request.header.get_message_id());
            packet.set_token(request.get_token().to_vec());
            packet.payload = payload.to_vec();
            packet
        }
    }

    fn fast_params() -> TransmissionParameters {
        TransmissionParameters {
            ack_timeout: Duration::from_millis(50),
            ack_random_factor: 1.0,
            max_retransmit: 2,
        }
    }

    #[tokio::test]
    async fn test_get_with_piggybacked_response() {
        let (peer, port) = TestPeer::bind().await;

        tokio::spawn(async move {
            let (request, src) = peer.recv().await;
            assert_eq!(request.header.get_version(), 1);
            assert_eq!(request.header.get_type(), MessageType::Confirmable);
            assert_eq!(
                request.header.code,
                MessageClass::Request(RequestType::Get)
            );
            let path: Vec<&str> = request
                .get_options(codes::URI_PATH)
                .map(|o| o.str_value().unwrap())
                .collect();
            assert_eq!(path, vec!["sensors", "temp"]);
            let query: Vec<&str> = request
                .get_options(codes::URI_QUERY)
                .map(|o| o.str_value().unwrap())
                .collect();
            assert_eq!(query, vec!["unit=c"]);

            let mut response =
                TestPeer::response_to(&request, MessageType::Acknowledgement, b"22.5");
            response.set_content_format(ContentFormat::TextPlain);
            peer.send(&response, src).await;
        });

        let client = CoAPClient::new();
        let response = client
            .get(&format!("coap://127.0.0.1:{}/sensors/temp?unit=c", port))
            .await
            .unwrap();
        assert_eq!(response.code, MessageClass::Response(ResponseType::Content));
        assert_eq!(response.content_format, Some(ContentFormat::TextPlain));
        assert_eq!(response.payload, b"22.5".to_vec());
        client.close().await;
    }

    #[tokio::test]
    async fn test_two_exchanges_correlate_by_token() {
        let (peer, port) = TestPeer::bind().await;

        tokio::spawn(async move {
            let (first, src) = peer.recv().await;
            let (second, _) = peer.recv().await;
            assert_ne!(first.get_token(), second.get_token());
            assert_ne!(
                first.header.get_message_id(),
                second.header.get_message_id()
            );

            // answer in reverse arrival order; tokens keep them straight
            peer.send(
                &TestPeer::response_to(&second, MessageType::Acknowledgement, b"second"),
                src,
            )
            .await;
            peer.send(
                &TestPeer::response_to(&first, MessageType::Acknowledgement, b"first"),
                src,
            )
            .await;
        });

        let client = CoAPClient::new();
        let url_a = format!("coap://127.0.0.1:{}/a", port);
        let url_b = format!("coap://127.0.0.1:{}/b", port);
        let (a, b) = tokio::join!(client.get(&url_a), client.get(&url_b));
        assert_eq!(a.unwrap().payload, b"first".to_vec());
        assert_eq!(b.unwrap().payload, b"second".to_vec());
        client.close().await;
    }

    #[tokio::test]
    async fn test_retransmission_exhausted() {
        let (peer, port) = TestPeer::bind().await;
        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();

        tokio::spawn(async move {
            loop {
                peer.recv().await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let client = CoAPClient::with_parameters(fast_params());
        let err = client
            .get(&format!("coap://127.0.0.1:{}/never", port))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::RetransmissionExhausted));
        // original transmission plus max_retransmit resends
        sleep(Duration::from_millis(100)).await;
        assert_eq!(received.load(Ordering::SeqCst), 3);
        client.close().await;
    }

    #[tokio::test]
    async fn test_ack_stops_retransmission_separate_response() {
        let (peer, port) = TestPeer::bind().await;

        let server = tokio::spawn(async move {
            let (request, src) = peer.recv().await;

            // bare ACK: acknowledged but response still pending
            let mut ack = Packet::new();
            ack.header.set_version(1);
            ack.header.set_type(MessageType::Acknowledgement);
            ack.header.set_message_id(request.header.get_message_id());
            peer.send(&ack, src).await;

            // no retransmission may arrive while we sit on the response
            assert!(peer.recv_within(Duration::from_millis(250)).await.is_none());

            // a separate response travels in its own confirmable message
            let mut response = TestPeer::response_to(&request, MessageType::Confirmable, b"late");
            response.header.set_message_id(0x2222);
            peer.send(&response, src).await;

            // the confirmable response must be acknowledged
            let (reply, _) = peer.recv_within(Duration::from_secs(2)).await.unwrap();
            assert_eq!(reply.header.get_type(), MessageType::Acknowledgement);
            assert_eq!(reply.header.code, MessageClass::Empty);
            assert_eq!(
                reply.header.get_message_id(),
                response.header.get_message_id()
            );
        });

        let client = CoAPClient::with_parameters(TransmissionParameters {
            ack_timeout: Duration::from_millis(50),
            ack_random_factor: 1.0,
            max_retransmit: 4,
        });
        let response = client
            .get(&format!("coap://127.0.0.1:{}/slow", port))
            .await
            .unwrap();
        assert_eq!(response.payload, b"late".to_vec());
        server.await.unwrap();
        client.close().await;
    }

    #[tokio::test]
    async fn test_non_confirmable_is_not_retransmitted() {
        let (peer, port) = TestPeer::bind().await;

        let server = tokio::spawn(async move {
            let (request, src) = peer.recv().await;
            assert_eq!(request.header.get_type(), MessageType::NonConfirmable);

            // longer than several backoff periods
            assert!(peer.recv_within(Duration::from_millis(250)).await.is_none());

            peer.send(
                &TestPeer::response_to(&request, MessageType::NonConfirmable, b"ok"),
                src,
            )
            .await;
        });

        let client = CoAPClient::with_parameters(fast_params());
        let response = client
            .request(
                &format!("coap://127.0.0.1:{}/non", port),
                RequestType::Get,
                None,
                RequestOptions {
                    confirmable: false,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(response.payload, b"ok".to_vec());
        server.await.unwrap();
        client.close().await;
    }

    #[tokio::test]
    async fn test_unknown_token_triggers_reset() {
        let (peer, port) = TestPeer::bind().await;

        let server = tokio::spawn(async move {
            let (request, src) = peer.recv().await;
            peer.send(
                &TestPeer::response_to(&request, MessageType::Acknowledgement, b"ok"),
                src,
            )
            .await;

            // a notification for a token this client never issued
            let mut stale = Packet::new();
            stale.header.set_version(1);
            stale.header.set_type(MessageType::NonConfirmable);
            stale.header.code = MessageClass::Response(ResponseType::Content);
            stale.header.set_message_id(0x7777);
            stale.set_token(vec![0xDE, 0xAD, 0xBE, 0xEF]);
            stale.payload = b"stale".to_vec();
            peer.send(&stale, src).await;

            let (reset, _) = peer.recv_within(Duration::from_secs(2)).await.unwrap();
            assert_eq!(reset.header.get_type(), MessageType::Reset);
            assert_eq!(reset.header.code, MessageClass::Empty);
            assert_eq!(reset.header.get_message_id(), 0x7777);
        });

        let client = CoAPClient::new();
        client
            .get(&format!("coap://127.0.0.1:{}/x", port))
            .await
            .unwrap();
        server.await.unwrap();
        client.close().await;
    }

    #[tokio::test]
    async fn test_observe_notifications_and_stop() {
        let (peer, port) = TestPeer::bind().await;
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();

        let server = tokio::spawn(async move {
            let (request, src) = peer.recv().await;
            assert_eq!(request.get_observe(), Some(0));
            let token = request.get_token().to_vec();

            // registration answer doubles as the first notification
            peer.send(
                &TestPeer::response_to(&request, MessageType::Acknowledgement, b"n1"),
                src,
            )
            .await;
            sleep(Duration::from_millis(50)).await;

            // confirmable notification: expect an ACK back
            let mut notification = Packet::new();
            notification.header.set_version(1);
            notification.header.set_type(MessageType::Confirmable);
            notification.header.code = MessageClass::Response(ResponseType::Content);
            notification.header.set_message_id(0x4242);
            notification.set_token(token.clone());
            notification.payload = b"n2".to_vec();
            peer.send(&notification, src).await;

            let (ack, _) = peer.recv_within(Duration::from_secs(2)).await.unwrap();
            assert_eq!(ack.header.get_type(), MessageType::Acknowledgement);
            assert_eq!(ack.header.get_message_id(), 0x4242);

            (peer, src, token)
        });

        let client = CoAPClient::new();
        let url = format!("coap://127.0.0.1:{}/feed", port);
        client
            .observe(
                &url,
                RequestType::Get,
                move |response: CoapResponse| {
                    sink.lock().unwrap().push(response.payload);
                },
                None,
                Default::default(),
            )
            .await
            .unwrap();

        let (peer, src, token) = server.await.unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![b"n1".to_vec(), b"n2".to_vec()]
        );

        client.stop_observing(&url).unwrap();

        // the subscription is gone locally; a further notification is
        // answered with RST and does not reach the handler
        let mut stale = Packet::new();
        stale.header.set_version(1);
        stale.header.set_type(MessageType::NonConfirmable);
        stale.header.code = MessageClass::Response(ResponseType::Content);
        stale.header.set_message_id(0x4243);
        stale.set_token(token);
        stale.payload = b"n3".to_vec();
        peer.send(&stale, src).await;

        let (reset, _) = peer.recv_within(Duration::from_secs(2)).await.unwrap();
        assert_eq!(reset.header.get_type(), MessageType::Reset);
        assert_eq!(reset.header.get_message_id(), 0x4243);
        assert_eq!(seen.lock().unwrap().len(), 2);
        client.close().await;
    }

    #[tokio::test]
    async fn test_request_on_observed_url_keeps_subscription() {
        let (peer, port) = TestPeer::bind().await;
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();

        let server = tokio::spawn(async move {
            let (registration, src) = peer.recv().await;
            assert_eq!(registration.get_observe(), Some(0));
            let token = registration.get_token().to_vec();
            peer.send(
                &TestPeer::response_to(&registration, MessageType::Acknowledgement, b"n1"),
                src,
            )
            .await;

            // a plain request to the same resource, on its own token
            let (request, src) = peer.recv().await;
            assert!(request.get_observe().is_none());
            assert_ne!(request.get_token(), token.as_slice());
            peer.send(
                &TestPeer::response_to(&request, MessageType::Acknowledgement, b"direct"),
                src,
            )
            .await;

            (peer, src, token)
        });

        let client = CoAPClient::new();
        let url = format!("coap://127.0.0.1:{}/feed", port);
        client
            .observe(
                &url,
                RequestType::Get,
                move |response: CoapResponse| {
                    sink.lock().unwrap().push(response.payload);
                },
                None,
                Default::default(),
            )
            .await
            .unwrap();
        let direct = client.get(&url).await.unwrap();
        assert_eq!(direct.payload, b"direct".to_vec());

        let (peer, src, token) = server.await.unwrap();
        sleep(Duration::from_millis(50)).await;

        // the one-shot must not have stolen the subscription's url key
        client.stop_observing(&url).unwrap();

        let mut stale = Packet::new();
        stale.header.set_version(1);
        stale.header.set_type(MessageType::NonConfirmable);
        stale.header.code = MessageClass::Response(ResponseType::Content);
        stale.header.set_message_id(0x5555);
        stale.set_token(token);
        stale.payload = b"n2".to_vec();
        peer.send(&stale, src).await;

        let (reset, _) = peer.recv_within(Duration::from_secs(2)).await.unwrap();
        assert_eq!(reset.header.get_type(), MessageType::Reset);
        assert_eq!(reset.header.get_message_id(), 0x5555);
        assert_eq!(*seen.lock().unwrap(), vec![b"n1".to_vec()]);
        client.close().await;
    }

    #[tokio::test]
    async fn test_token_match_is_scoped_to_origin() {
        let (peer_a, port_a) = TestPeer::bind().await;
        let (peer_b, port_b) = TestPeer::bind().await;

        let server = tokio::spawn(async move {
            let (request_a, src_a) = peer_a.recv().await;
            let (request_b, src_b) = peer_b.recv().await;

            // the other peer's token is an unknown token here
            let mut cross =
                TestPeer::response_to(&request_b, MessageType::NonConfirmable, b"cross");
            cross.set_token(request_a.get_token().to_vec());
            peer_b.send(&cross, src_b).await;

            let (reset, _) = peer_b.recv_within(Duration::from_secs(2)).await.unwrap();
            assert_eq!(reset.header.get_type(), MessageType::Reset);
            assert_eq!(
                reset.header.get_message_id(),
                cross.header.get_message_id()
            );

            peer_a
                .send(
                    &TestPeer::response_to(&request_a, MessageType::Acknowledgement, b"a"),
                    src_a,
                )
                .await;
            peer_b
                .send(
                    &TestPeer::response_to(&request_b, MessageType::Acknowledgement, b"b"),
                    src_b,
                )
                .await;
        });

        let client = CoAPClient::new();
        let url_a = format!("coap://127.0.0.1:{}/a", port_a);
        let url_b = format!("coap://127.0.0.1:{}/b", port_b);
        let (a, b) = tokio::join!(client.get(&url_a), client.get(&url_b));
        assert_eq!(a.unwrap().payload, b"a".to_vec());
        assert_eq!(b.unwrap().payload, b"b".to_vec());
        server.await.unwrap();
        client.close().await;
    }

    #[tokio::test]
    async fn test_keep_alive_false_tears_down_connection() {
        let (peer, port) = TestPeer::bind().await;

        let server = tokio::spawn(async move {
            let (first, first_src) = peer.recv().await;
            peer.send(
                &TestPeer::response_to(&first, MessageType::Acknowledgement, b"1"),
                first_src,
            )
            .await;

            let (second, second_src) = peer.recv().await;
            peer.send(
                &TestPeer::response_to(&second, MessageType::Acknowledgement, b"2"),
                second_src,
            )
            .await;

            // a fresh connection binds a fresh local port
            assert_ne!(first_src.port(), second_src.port());
        });

        let client = CoAPClient::new();
        let url = format!("coap://127.0.0.1:{}/once", port);
        let options = RequestOptions {
            keep_alive: false,
            ..Default::default()
        };
        client
            .request(&url, RequestType::Get, None, options.clone())
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;
        client
            .request(&url, RequestType::Get, None, options)
            .await
            .unwrap();
        server.await.unwrap();
        client.close().await;
    }

    #[tokio::test]
    async fn test_unsupported_protocol() {
        let client = CoAPClient::new();
        let err = client.get("http://127.0.0.1/x").await.unwrap_err();
        assert!(matches!(err, ClientError::UnsupportedProtocol(_)));
    }

    #[cfg(feature = "dtls")]
    #[tokio::test]
    async fn test_coaps_without_parameters() {
        let client = CoAPClient::new();
        let err = client.get("coaps://127.0.0.1/x").await.unwrap_err();
        match err {
            ClientError::NoSecurityParameters(host) => assert_eq!(host, "127.0.0.1"),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
