#![allow(unsafe_code)]
//! Typed account identifiers.

use std::fmt;

use signal_chat_sys::SignalServiceIdFixedWidthBinaryBytes;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::ffi::{
    invoke_fn_returning_bytes, invoke_fn_returning_serialized, invoke_fn_returning_string,
    to_c_string,
};
use crate::net::Net;

const ACI_KIND: u8 = 0;
const PNI_KIND: u8 = 1;

/// Length of the fixed-width binary form: kind byte plus UUID.
pub const FIXED_WIDTH_LEN: usize = 17;

/// An account identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceId {
    /// Account identity.
    Aci(Uuid),
    /// Phone number identity.
    Pni(Uuid),
}

impl ServiceId {
    /// The underlying UUID.
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        match *self {
            Self::Aci(uuid) | Self::Pni(uuid) => uuid,
        }
    }

    /// Kind byte followed by the UUID bytes.
    #[must_use]
    pub fn to_fixed_width_binary(&self) -> [u8; FIXED_WIDTH_LEN] {
        let kind = match self {
            Self::Aci(_) => ACI_KIND,
            Self::Pni(_) => PNI_KIND,
        };
        let mut out = [0u8; FIXED_WIDTH_LEN];
        out[0] = kind;
        out[1..].copy_from_slice(self.uuid().as_bytes());
        out
    }

    /// Inverse of [`to_fixed_width_binary`](Self::to_fixed_width_binary).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Precondition`] for an unknown kind byte.
    pub fn from_fixed_width_binary(bytes: &[u8; FIXED_WIDTH_LEN]) -> Result<Self> {
        let [kind, uuid @ ..] = *bytes;
        let uuid = Uuid::from_bytes(uuid);
        match kind {
            ACI_KIND => Ok(Self::Aci(uuid)),
            PNI_KIND => Ok(Self::Pni(uuid)),
            other => Err(Error::Precondition(format!(
                "unknown service id kind {other}"
            ))),
        }
    }
}

impl TryFrom<&[u8]> for ServiceId {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let fixed: &[u8; FIXED_WIDTH_LEN] = bytes.try_into().map_err(|_| {
            Error::Precondition(format!(
                "service id must be {FIXED_WIDTH_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Self::from_fixed_width_binary(fixed)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aci(uuid) => write!(f, "{uuid}"),
            Self::Pni(uuid) => write!(f, "PNI:{uuid}"),
        }
    }
}

impl Net {
    /// Parse the textual form (`<uuid>` or `PNI:<uuid>`).
    ///
    /// # Errors
    ///
    /// Returns the native error for malformed input.
    pub fn parse_service_id(&self, input: &str) -> Result<ServiceId> {
        let api = self.api();
        let input = to_c_string(input)?;
        invoke_fn_returning_serialized::<SignalServiceIdFixedWidthBinaryBytes, _>(api, |out| unsafe {
            (api.service_id_parse_from_service_id_string)(out, input.as_ptr())
        })
    }

    /// Textual form as produced by the native library.
    ///
    /// # Errors
    ///
    /// Returns the native error.
    pub fn service_id_string(&self, id: &ServiceId) -> Result<String> {
        let api = self.api();
        let fixed = id.to_fixed_width_binary();
        invoke_fn_returning_string(api, |out| unsafe {
            (api.service_id_service_id_string)(out, &raw const fixed)
        })
    }

    /// Variable-length binary form: 16 bytes for ACIs, 17 for PNIs.
    ///
    /// # Errors
    ///
    /// Returns the native error.
    pub fn service_id_binary(&self, id: &ServiceId) -> Result<Vec<u8>> {
        let api = self.api();
        let fixed = id.to_fixed_width_binary();
        invoke_fn_returning_bytes(api, |out| unsafe {
            (api.service_id_service_id_binary)(out, &raw const fixed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: Uuid = Uuid::from_u128(0x9d0652a3_dcc3_4d11_975f_74d61598733f);

    #[test]
    fn fixed_width_round_trip() {
        for id in [ServiceId::Aci(UUID), ServiceId::Pni(UUID)] {
            let bytes = id.to_fixed_width_binary();
            assert_eq!(ServiceId::from_fixed_width_binary(&bytes).unwrap(), id);
        }
        assert_eq!(ServiceId::Pni(UUID).to_fixed_width_binary()[0], PNI_KIND);
    }

    #[test]
    fn unknown_kind_is_precondition() {
        let mut bytes = ServiceId::Aci(UUID).to_fixed_width_binary();
        bytes[0] = 0x7f;
        assert!(matches!(
            ServiceId::from_fixed_width_binary(&bytes),
            Err(Error::Precondition(_))
        ));
    }

    #[test]
    fn wrong_length_is_precondition() {
        assert!(matches!(
            ServiceId::try_from(&[0u8; 16][..]),
            Err(Error::Precondition(_))
        ));
    }

    #[test]
    fn display_matches_textual_form() {
        assert_eq!(
            ServiceId::Pni(UUID).to_string(),
            "PNI:9d0652a3-dcc3-4d11-975f-74d61598733f"
        );
        assert_eq!(
            ServiceId::Aci(UUID).to_string(),
            "9d0652a3-dcc3-4d11-975f-74d61598733f"
        );
    }
}
