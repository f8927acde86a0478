//! Concrete protocol codecs
//!
//! | Codec | Transport | Encoding | Checksum |
//! |---|---|---|---|
//! | [`A1eCodec`] | TCP | binary / ASCII | none |
//! | [`McCodec`] | TCP / UDP | binary / ASCII | none |
//! | [`A3cCodec`] | serial | ASCII format 1 | Sum8 |
//! | [`FinsCodec`] | TCP / UDP | binary | none |
//! | [`HostLinkCodec`] | serial | ASCII | Xor8 |

pub mod a1e;
pub mod a3c;
pub mod fins;
pub mod hostlink;
pub mod mc;

pub use a1e::A1eCodec;
pub use a3c::A3cCodec;
pub use fins::{FinsCodec, FinsFraming};
pub use hostlink::HostLinkCodec;
pub use mc::McCodec;

use serde::{Deserialize, Serialize};

use crate::error::{PlcError, PlcResult};
use crate::protocol::FrameCodec;

/// Wire encoding of a codec that supports both
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Binary,
    Ascii,
}

/// Fail with `ShortResponse` unless `raw` holds at least `min` bytes
pub(crate) fn require_len(raw: &[u8], min: usize) -> PlcResult<()> {
    if raw.len() < min {
        return Err(PlcError::short_response(min, raw.len()));
    }
    Ok(())
}

/// Turn a non-zero status into `ProtocolStatus`
pub(crate) fn check_status<C: FrameCodec + ?Sized>(codec: &C, status: u16) -> PlcResult<()> {
    if status != 0 {
        return Err(PlcError::protocol_status(status, codec.describe_status(status)));
    }
    Ok(())
}

/// Round a bit count up to an even number of characters / nibbles
pub(crate) fn even(points: usize) -> usize {
    points + (points & 1)
}
