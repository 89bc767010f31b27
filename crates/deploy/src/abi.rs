//! Minimal contract ABI encoding for initializer calls and proxy plumbing.
//!
//! Only the shapes the orchestrator needs are supported: calls with static
//! (`address`, `bool`, `uintN`, `bytesN`) and dynamic (`string`, `bytes`)
//! parameters, the ERC1967 proxy constructor, and `upgradeTo(address)`.

use alloy_core::primitives::{Address, Bytes, U256, keccak256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of one ABI word.
const WORD: usize = 32;

/// Selector of `upgradeTo(address)`.
pub const UPGRADE_TO_SELECTOR: [u8; 4] = [0x36, 0x59, 0xcf, 0xe6];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AbiError {
    #[error("malformed function signature `{0}`")]
    MalformedSignature(String),
    #[error("unsupported parameter type `{0}`")]
    UnsupportedType(String),
    #[error("expected {expected} arguments, got {got}")]
    ArgumentCount { expected: usize, got: usize },
    #[error("invalid `{ty}` argument `{value}`: {reason}")]
    InvalidArgument {
        ty: String,
        value: String,
        reason: String,
    },
}

/// Initializer invoked atomically with proxy construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitCall {
    /// Function signature, e.g. `initialize(address,uint256)`.
    pub signature: String,
    /// Arguments in textual form, one per parameter.
    pub args: Vec<String>,
}

impl Default for InitCall {
    fn default() -> Self {
        Self {
            signature: "initialize()".to_string(),
            args: Vec::new(),
        }
    }
}

impl InitCall {
    pub fn new<I, S>(signature: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            signature: signature.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// ABI-encode the call (selector followed by arguments).
    pub fn encode(&self) -> Result<Bytes, AbiError> {
        encode_call(&self.signature, &self.args)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamType {
    Address,
    Bool,
    Uint(usize),
    FixedBytes(usize),
    Bytes,
    String,
}

impl ParamType {
    fn parse(ty: &str) -> Result<Self, AbiError> {
        let unsupported = || AbiError::UnsupportedType(ty.to_string());
        match ty {
            "address" => Ok(ParamType::Address),
            "bool" => Ok(ParamType::Bool),
            "bytes" => Ok(ParamType::Bytes),
            "string" => Ok(ParamType::String),
            "uint" => Ok(ParamType::Uint(256)),
            _ => {
                if let Some(bits) = ty.strip_prefix("uint") {
                    let bits: usize = bits.parse().map_err(|_| unsupported())?;
                    if bits == 0 || bits > 256 || bits % 8 != 0 {
                        return Err(unsupported());
                    }
                    Ok(ParamType::Uint(bits))
                } else if let Some(len) = ty.strip_prefix("bytes") {
                    let len: usize = len.parse().map_err(|_| unsupported())?;
                    if len == 0 || len > WORD {
                        return Err(unsupported());
                    }
                    Ok(ParamType::FixedBytes(len))
                } else {
                    Err(unsupported())
                }
            }
        }
    }

    fn is_dynamic(self) -> bool {
        matches!(self, ParamType::Bytes | ParamType::String)
    }
}

/// First four bytes of the keccak hash of a canonical signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Encode a call to `signature` with textual `args`.
pub fn encode_call(signature: &str, args: &[String]) -> Result<Bytes, AbiError> {
    let signature: String = signature.chars().filter(|c| !c.is_whitespace()).collect();
    let malformed = || AbiError::MalformedSignature(signature.clone());

    let open = signature.find('(').ok_or_else(malformed)?;
    if open == 0 || !signature.ends_with(')') {
        return Err(malformed());
    }
    let params = &signature[open + 1..signature.len() - 1];
    let types = if params.is_empty() {
        Vec::new()
    } else {
        params
            .split(',')
            .map(ParamType::parse)
            .collect::<Result<Vec<_>, _>>()?
    };

    if types.len() != args.len() {
        return Err(AbiError::ArgumentCount {
            expected: types.len(),
            got: args.len(),
        });
    }

    let mut out = selector(&signature).to_vec();
    out.extend(encode_params(&types, args)?);
    Ok(out.into())
}

fn encode_params(types: &[ParamType], args: &[String]) -> Result<Vec<u8>, AbiError> {
    let mut head = Vec::with_capacity(types.len() * WORD);
    let mut tail = Vec::new();

    for (ty, arg) in types.iter().zip(args) {
        if ty.is_dynamic() {
            let offset = types.len() * WORD + tail.len();
            head.extend(uint_word(U256::from(offset)));
            tail.extend(encode_dynamic(*ty, arg)?);
        } else {
            head.extend(encode_static(*ty, arg)?);
        }
    }

    head.extend(tail);
    Ok(head)
}

fn invalid(ty: ParamType, value: &str, reason: impl Into<String>) -> AbiError {
    AbiError::InvalidArgument {
        ty: format!("{ty:?}").to_lowercase(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn encode_static(ty: ParamType, arg: &str) -> Result<[u8; WORD], AbiError> {
    match ty {
        ParamType::Address => {
            let address: Address = arg.parse().map_err(|e| invalid(ty, arg, format!("{e}")))?;
            Ok(address_word(address))
        }
        ParamType::Bool => match arg {
            "true" => Ok(uint_word(U256::from(1))),
            "false" => Ok(uint_word(U256::ZERO)),
            _ => Err(invalid(ty, arg, "expected `true` or `false`")),
        },
        ParamType::Uint(bits) => {
            let value: U256 = arg.parse().map_err(|e| invalid(ty, arg, format!("{e}")))?;
            if bits < 256 && value >= (U256::from(1) << bits) {
                return Err(invalid(ty, arg, format!("does not fit in {bits} bits")));
            }
            Ok(uint_word(value))
        }
        ParamType::FixedBytes(len) => {
            let raw = decode_hex(arg).map_err(|reason| invalid(ty, arg, reason))?;
            if raw.len() != len {
                return Err(invalid(ty, arg, format!("expected {len} bytes, got {}", raw.len())));
            }
            let mut word = [0u8; WORD];
            word[..len].copy_from_slice(&raw);
            Ok(word)
        }
        ParamType::Bytes | ParamType::String => Err(invalid(ty, arg, "dynamic type in a static position")),
    }
}

fn encode_dynamic(ty: ParamType, arg: &str) -> Result<Vec<u8>, AbiError> {
    let raw = match ty {
        ParamType::String => arg.as_bytes().to_vec(),
        _ => decode_hex(arg).map_err(|reason| invalid(ty, arg, reason))?,
    };
    Ok(encode_bytes(&raw))
}

/// Length-prefixed, right-padded encoding of a dynamic byte string.
fn encode_bytes(raw: &[u8]) -> Vec<u8> {
    let mut out = uint_word(U256::from(raw.len())).to_vec();
    out.extend_from_slice(raw);
    out.resize(WORD + raw.len().div_ceil(WORD) * WORD, 0);
    out
}

fn decode_hex(value: &str) -> Result<Vec<u8>, String> {
    hex::decode(value.strip_prefix("0x").unwrap_or(value)).map_err(|e| e.to_string())
}

fn uint_word(value: U256) -> [u8; WORD] {
    value.to_be_bytes::<WORD>()
}

fn address_word(address: Address) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[WORD - 20..].copy_from_slice(address.as_slice());
    word
}

/// Constructor arguments of an ERC1967 proxy: `(address logic, bytes data)`.
pub fn encode_proxy_constructor(implementation: Address, init_data: &[u8]) -> Vec<u8> {
    let mut out = address_word(implementation).to_vec();
    out.extend(uint_word(U256::from(2 * WORD)));
    out.extend(encode_bytes(init_data));
    out
}

/// Calldata of `upgradeTo(implementation)`.
pub fn encode_upgrade_to(implementation: Address) -> Bytes {
    let mut out = UPGRADE_TO_SELECTOR.to_vec();
    out.extend(address_word(implementation));
    out.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: &str = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";

    #[test]
    fn test_selector() {
        assert_eq!(selector("upgradeTo(address)"), UPGRADE_TO_SELECTOR);
        assert_eq!(hex::encode(selector("initialize()")), "8129fc1c");
        assert_eq!(hex::encode(selector("transfer(address,uint256)")), "a9059cbb");
    }

    #[test]
    fn test_default_init_call() {
        let data = InitCall::default().encode().unwrap();
        assert_eq!(data.as_ref(), &hex::decode("8129fc1c").unwrap()[..]);
    }

    #[test]
    fn test_encode_static_arguments() {
        let data = encode_call(
            "transfer(address, uint256)",
            &[OWNER.to_string(), "1000000000000000000".to_string()],
        )
        .unwrap();

        assert_eq!(data.len(), 4 + 2 * WORD);
        assert_eq!(
            hex::encode(&data[4..36]),
            "00000000000000000000000070997970c51812dc3a010c7d01b50e0d17dc79c8"
        );
        assert_eq!(
            hex::encode(&data[36..68]),
            "0000000000000000000000000000000000000000000000000de0b6b3a7640000"
        );
    }

    #[test]
    fn test_encode_dynamic_argument() {
        let data = encode_call(
            "initialize(string,address)",
            &["ASC20".to_string(), OWNER.to_string()],
        )
        .unwrap();

        // head: offset + address, tail: length + one padded word
        assert_eq!(data.len(), 4 + 4 * WORD);
        assert_eq!(data[4 + WORD - 1], 0x40);
        assert_eq!(data[4 + 3 * WORD - 1], 5);
        assert_eq!(&data[4 + 3 * WORD..4 + 3 * WORD + 5], b"ASC20");
    }

    #[test]
    fn test_argument_errors() {
        assert_eq!(
            encode_call("initialize(address)", &[]),
            Err(AbiError::ArgumentCount { expected: 1, got: 0 })
        );
        assert!(matches!(
            encode_call("initialize(uint8)", &["256".to_string()]),
            Err(AbiError::InvalidArgument { .. })
        ));
        assert!(matches!(
            encode_call("initialize(int256)", &["1".to_string()]),
            Err(AbiError::UnsupportedType(_))
        ));
        assert!(matches!(
            encode_call("initialize", &[]),
            Err(AbiError::MalformedSignature(_))
        ));
        assert!(matches!(
            encode_call("initialize(bytes4)", &["0x1234".to_string()]),
            Err(AbiError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_encode_proxy_constructor() {
        let implementation: Address = OWNER.parse().unwrap();
        let init = hex::decode("8129fc1c").unwrap();
        let encoded = encode_proxy_constructor(implementation, &init);

        assert_eq!(encoded.len(), 4 * WORD);
        assert_eq!(&encoded[12..32], implementation.as_slice());
        assert_eq!(encoded[2 * WORD - 1], 0x40);
        assert_eq!(encoded[3 * WORD - 1], 4);
        assert_eq!(&encoded[3 * WORD..3 * WORD + 4], &init[..]);
    }

    #[test]
    fn test_encode_upgrade_to() {
        let implementation: Address = OWNER.parse().unwrap();
        let data = encode_upgrade_to(implementation);
        assert_eq!(&data[..4], &UPGRADE_TO_SELECTOR);
        assert_eq!(&data[16..], implementation.as_slice());
    }
}
