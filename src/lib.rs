//! An asynchronous client for the [CoAP Protocol][spec].
//!
//! Features:
//! - CoAP core protocol [RFC 7252](https://tools.ietf.org/rfc/rfc7252.txt)
//! - CoAP Observe option [RFC 7641](https://tools.ietf.org/rfc/rfc7641.txt)
//! - Confirmable requests with retransmission and backoff
//! - DTLS with pre-shared keys via [webrtc-rs](https://github.com/webrtc-rs/webrtc)
//!
//! [spec]: https://tools.ietf.org/rfc/rfc7252.txt
//!
//! # Example
//!
//! ```no_run
//! use coap_client::CoAPClient;
//!
//! #[tokio::main]
//! async fn main() {
//!     let url = "coap://127.0.0.1:5683/Rust";
//!     println!("Client request: {}", url);
//!
//!     let client = CoAPClient::new();
//!     let response = client.get(url).await.unwrap();
//!     println!("Server reply: {}", String::from_utf8(response.payload).unwrap());
//! }
//! ```
//!
//! # Observing a resource
//!
//! ```no_run
//! use coap_client::{CoAPClient, CoapResponse, RequestType};
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = CoAPClient::new();
//!     client
//!         .observe(
//!             "coap://127.0.0.1:5683/sensors/temp",
//!             RequestType::Get,
//!             |notification: CoapResponse| {
//!                 println!("{:?}", notification.payload);
//!             },
//!             None,
//!             Default::default(),
//!         )
//!         .await
//!         .unwrap();
//! }
//! ```

pub mod client;
#[cfg(feature = "dtls")]
pub mod dtls;
pub mod error;
pub mod message;
pub mod transport;

pub use self::client::{
    CoAPClient, CoapResponse, RequestOptions, SecurityParameters, TransmissionParameters,
};
pub use self::error::{ClientError, OptionError, ParseError};
pub use self::message::{MessageClass, MessageType, Packet, RequestType, ResponseType};
