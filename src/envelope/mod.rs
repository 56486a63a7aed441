//! Request/response envelopes and the flow codec.
//!
//! Every HTTP exchange crossing the air gap is serialized to a JSON envelope:
//! the proxy writes a request envelope into the rendezvous directory, the
//! forwarder answers with a response envelope under the same correlation id.
//!
//! The codec is pure serialization with two extra duties:
//! - It computes the SHA-256 body hash on encode and verifies it on decode;
//!   a mismatch is [`CodecError::Integrity`].
//! - It is forward compatible: unknown fields are ignored on decode, while
//!   missing required fields reject the envelope.
//!
//! Header order and multiplicity are preserved verbatim by modeling headers
//! as a list of `[name, value]` pairs rather than a map.

mod codec;
mod error;
mod types;

pub use codec::{decode_request, decode_response, encode_request, encode_response, sha256_hex};
pub use error::CodecError;
pub use types::{
    HeaderList, RequestEnvelope, RequestMeta, RequestPayload, RequestSecurity, ResponseEnvelope,
    ResponseMeta, ResponsePayload, ResponseSecurity, ScanResults, SecurityStatus,
    DEFAULT_MAX_RESPONSE_SIZE,
};
