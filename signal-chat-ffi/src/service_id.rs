//! Service id parsing and formatting.

use std::ffi::c_char;

use signal_chat_sys::{SignalFfiError, SignalOwnedBuffer, SignalServiceIdFixedWidthBinaryBytes};
use uuid::Uuid;

use crate::ffi::{
    FfiError, FfiResult, c_str_to_string, catch, owned_buffer, ref_from, to_c_string, write_value,
};

const ACI: u8 = 0;
const PNI: u8 = 1;
const PNI_PREFIX: &str = "PNI:";

fn decode(bytes: &SignalServiceIdFixedWidthBinaryBytes) -> FfiResult<(u8, Uuid)> {
    let [kind, uuid @ ..] = *bytes;
    match kind {
        ACI | PNI => Ok((kind, Uuid::from_bytes(uuid))),
        other => Err(FfiError::invalid_argument(format!(
            "unknown service id kind {other}"
        ))),
    }
}

fn encode(kind: u8, uuid: Uuid) -> SignalServiceIdFixedWidthBinaryBytes {
    let mut out = [0; 17];
    out[0] = kind;
    out[1..].copy_from_slice(uuid.as_bytes());
    out
}

fn parse(input: &str) -> FfiResult<SignalServiceIdFixedWidthBinaryBytes> {
    let (kind, uuid) = match input.strip_prefix(PNI_PREFIX) {
        Some(rest) => (PNI, rest),
        None => (ACI, input),
    };
    Uuid::try_parse(uuid)
        .map(|uuid| encode(kind, uuid))
        .map_err(|e| FfiError::invalid_argument(format!("invalid service id {input:?}: {e}")))
}

/// Parse `<uuid>` (ACI) or `PNI:<uuid>`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_service_id_parse_from_service_id_string(
    out: *mut SignalServiceIdFixedWidthBinaryBytes,
    input: *const c_char,
) -> *mut SignalFfiError {
    catch(|| {
        let input = unsafe { c_str_to_string(input, "input")? };
        let parsed = parse(&input)?;
        unsafe { write_value(out, parsed) }
    })
}

/// Textual form: the hyphenated UUID, prefixed with `PNI:` for PNIs.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_service_id_service_id_string(
    out: *mut *const c_char,
    value: *const SignalServiceIdFixedWidthBinaryBytes,
) -> *mut SignalFfiError {
    catch(|| {
        let (kind, uuid) = decode(unsafe { ref_from(value, "value")? })?;
        let text = match kind {
            PNI => format!("{PNI_PREFIX}{uuid}"),
            _ => uuid.to_string(),
        };
        if out.is_null() {
            return Err(FfiError::null_parameter("output pointer"));
        }
        unsafe { out.write(to_c_string(&text)?.cast_const()) };
        Ok(())
    })
}

/// Variable-length binary form: 16 UUID bytes for ACIs, kind byte plus UUID for PNIs.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_service_id_service_id_binary(
    out: *mut SignalOwnedBuffer,
    value: *const SignalServiceIdFixedWidthBinaryBytes,
) -> *mut SignalFfiError {
    catch(|| {
        let value = unsafe { ref_from(value, "value")? };
        let (kind, _) = decode(value)?;
        let bytes = match kind {
            ACI => value[1..].to_vec(),
            _ => value.to_vec(),
        };
        if out.is_null() {
            return Err(FfiError::null_parameter("output pointer"));
        }
        unsafe { out.write(owned_buffer(bytes)) };
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: &str = "9d0652a3-dcc3-4d11-975f-74d61598733f";

    #[test]
    fn parses_aci_and_pni() {
        let aci = parse(UUID).unwrap();
        assert_eq!(aci[0], ACI);
        let pni = parse(&format!("PNI:{UUID}")).unwrap();
        assert_eq!(pni[0], PNI);
        assert_eq!(aci[1..], pni[1..]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("PNI:not-a-uuid").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn rejects_unknown_kind() {
        let mut bytes = parse(UUID).unwrap();
        bytes[0] = 7;
        assert!(decode(&bytes).is_err());
    }
}
