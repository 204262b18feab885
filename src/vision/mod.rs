//! Vision flow: adaptive padding and direct-copy transition
//!
//! The initial records of a Vision connection wear TLS clothing; after a
//! known transcript point both directions pass through unframed. See
//! [`stream`] for the codec and [`detector`] for the record classifier.

mod detector;
mod error;
mod stream;

pub use detector::{
    is_application_data, is_handshake_or_ccs, is_valid_tls_version, looks_like_tls,
    parse_tls_record_header, HANDSHAKE_CLIENT_HELLO, HANDSHAKE_FINISHED, HANDSHAKE_SERVER_HELLO,
    TLS_ALERT, TLS_APPLICATION_DATA, TLS_CHANGE_CIPHER_SPEC, TLS_HANDSHAKE,
    TLS_RECORD_HEADER_SIZE,
};
pub use error::VisionError;
pub use stream::{VisionReader, VisionState, VisionWriter};
