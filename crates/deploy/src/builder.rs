//! Turns compiled module artifacts into deployable [`ModuleVersion`]s.
//!
//! Artifacts are JSON documents carrying the creation `bytecode` and the solc
//! `storageLayout` output. The storage layout descriptor is derived from the
//! layout's `storage` entries in declaration order, using the human-readable
//! type labels so the result does not depend on compiler AST ids or on the
//! build environment.

use std::{collections::BTreeMap, path::PathBuf};

use alloy_core::primitives::Bytes;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{
    layout::{StorageField, StorageLayout},
    types::{ModuleVersion, VersionId},
};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to read artifact {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("artifact is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("artifact has no deployable bytecode")]
    MissingBytecode,
    #[error("artifact bytecode is not valid hex: {0}")]
    InvalidBytecode(#[from] hex::FromHexError),
    #[error("artifact bytecode has unresolved library links")]
    UnlinkedBytecode,
    #[error("artifact has no storage layout; compile with the `storageLayout` output selection")]
    MissingStorageLayout,
    #[error("field `{field}` references unknown type `{ty}`")]
    UnknownType { field: String, ty: String },
    #[error("field `{field}` has an invalid {what}: `{value}`")]
    InvalidNumber {
        field: String,
        what: &'static str,
        value: String,
    },
    #[error("fields `{first}` and `{second}` overlap in storage")]
    OverlappingFields { first: String, second: String },
}

/// Where a module's compiled artifact comes from.
#[derive(Debug, Clone)]
pub enum ArtifactSource {
    Path(PathBuf),
    Json(String),
}

/// Input to [`ImplementationBuilder::build`].
#[derive(Debug, Clone)]
pub struct ModuleSource {
    pub version: VersionId,
    pub artifact: ArtifactSource,
}

impl ModuleSource {
    pub fn from_path(version: impl Into<VersionId>, path: impl Into<PathBuf>) -> Self {
        Self {
            version: version.into(),
            artifact: ArtifactSource::Path(path.into()),
        }
    }

    pub fn from_json(version: impl Into<VersionId>, json: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            artifact: ArtifactSource::Json(json.into()),
        }
    }
}

/// Produces deployable module versions.
pub trait ImplementationBuilder {
    fn build(&self, source: &ModuleSource) -> Result<ModuleVersion, BuildError>;
}

/// Builder for solc/Hardhat-style JSON artifacts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArtifactBuilder;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Artifact {
    #[serde(default)]
    contract_name: Option<String>,
    #[serde(default)]
    bytecode: Option<String>,
    #[serde(default)]
    storage_layout: Option<SolcStorageLayout>,
}

#[derive(Debug, Deserialize)]
struct SolcStorageLayout {
    storage: Vec<SolcStorageEntry>,
    #[serde(default)]
    types: BTreeMap<String, SolcType>,
}

#[derive(Debug, Deserialize)]
struct SolcStorageEntry {
    label: String,
    slot: NumberLike,
    offset: NumberLike,
    #[serde(rename = "type")]
    ty: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SolcType {
    label: String,
    number_of_bytes: NumberLike,
}

/// solc emits some numbers as strings (`"slot": "0"`) and others as integers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NumberLike {
    Int(u64),
    Str(String),
}

impl NumberLike {
    fn parse(&self, field: &str, what: &'static str) -> Result<u64, BuildError> {
        match self {
            NumberLike::Int(n) => Ok(*n),
            NumberLike::Str(s) => s.trim().parse().map_err(|_| BuildError::InvalidNumber {
                field: field.to_string(),
                what,
                value: s.clone(),
            }),
        }
    }
}

impl ImplementationBuilder for ArtifactBuilder {
    fn build(&self, source: &ModuleSource) -> Result<ModuleVersion, BuildError> {
        let json = match &source.artifact {
            ArtifactSource::Path(path) => {
                std::fs::read_to_string(path).map_err(|source| BuildError::Read {
                    path: path.clone(),
                    source,
                })?
            }
            ArtifactSource::Json(json) => json.clone(),
        };

        let artifact: Artifact = serde_json::from_str(&json)?;
        let bytecode = decode_bytecode(artifact.bytecode.as_deref())?;
        let layout = artifact
            .storage_layout
            .as_ref()
            .ok_or(BuildError::MissingStorageLayout)
            .and_then(derive_layout)?;
        let digest = compute_digest(&bytecode, &layout);
        let name = artifact.contract_name.unwrap_or_else(|| "module".to_string());

        tracing::debug!(
            contract = %name,
            version = %source.version,
            bytecode_len = bytecode.len(),
            fields = layout.fields.len(),
            digest = %digest,
            "Built module version"
        );

        Ok(ModuleVersion {
            name,
            identifier: source.version.clone(),
            bytecode,
            layout,
            digest,
        })
    }
}

/// Decode artifact bytecode without requiring a storage layout.
///
/// Used for infrastructure contracts such as the proxy itself.
pub fn load_bytecode(path: &PathBuf) -> Result<Bytes, BuildError> {
    let json = std::fs::read_to_string(path).map_err(|source| BuildError::Read {
        path: path.clone(),
        source,
    })?;
    let artifact: Artifact = serde_json::from_str(&json)?;
    decode_bytecode(artifact.bytecode.as_deref())
}

fn decode_bytecode(raw: Option<&str>) -> Result<Bytes, BuildError> {
    let raw = raw.map(str::trim).unwrap_or_default();
    let raw = raw.strip_prefix("0x").unwrap_or(raw);
    if raw.is_empty() {
        return Err(BuildError::MissingBytecode);
    }
    // Hardhat leaves `__$<hash>$__` placeholders for unlinked libraries.
    if raw.contains("__") {
        return Err(BuildError::UnlinkedBytecode);
    }
    Ok(hex::decode(raw)?.into())
}

fn derive_layout(solc: &SolcStorageLayout) -> Result<StorageLayout, BuildError> {
    let fields = solc
        .storage
        .iter()
        .map(|entry| {
            let ty = solc
                .types
                .get(&entry.ty)
                .ok_or_else(|| BuildError::UnknownType {
                    field: entry.label.clone(),
                    ty: entry.ty.clone(),
                })?;
            Ok(StorageField {
                name: entry.label.clone(),
                type_tag: ty.label.clone(),
                byte_width: ty.number_of_bytes.parse(&entry.label, "byte width")?,
                slot: entry.slot.parse(&entry.label, "slot")?,
                offset: entry.offset.parse(&entry.label, "offset")?,
            })
        })
        .collect::<Result<Vec<_>, BuildError>>()?;

    let layout = StorageLayout::new(fields);
    if let Some((first, second)) = layout.find_overlap() {
        return Err(BuildError::OverlappingFields {
            first: first.name.clone(),
            second: second.name.clone(),
        });
    }
    Ok(layout)
}

/// Compute a SHA-256 digest of the bytecode and the canonical layout.
///
/// The digest is deterministic: the same artifact always yields the same digest.
pub fn compute_digest(bytecode: &[u8], layout: &StorageLayout) -> String {
    let layout_json =
        serde_json::to_vec(layout).expect("StorageLayout serialization should never fail");

    let mut hasher = Sha256::new();
    hasher.update(bytecode);
    hasher.update(&layout_json);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Artifact JSON in the shape emitted by solc with `storageLayout` selected.
    pub(crate) fn artifact_json(bytecode: &str, fields: &[(&str, &str, u64, u64)]) -> String {
        let storage: Vec<_> = fields
            .iter()
            .map(|(label, ty, slot, offset)| {
                serde_json::json!({
                    "astId": 3,
                    "contract": "contracts/ASC20Market.sol:ASC20Market",
                    "label": label,
                    "offset": offset,
                    "slot": slot.to_string(),
                    "type": format!("t_{}", ty),
                })
            })
            .collect();

        serde_json::json!({
            "contractName": "ASC20Market",
            "bytecode": bytecode,
            "storageLayout": {
                "storage": storage,
                "types": {
                    "t_address": { "encoding": "inplace", "label": "address", "numberOfBytes": "20" },
                    "t_bool": { "encoding": "inplace", "label": "bool", "numberOfBytes": "1" },
                    "t_uint256": { "encoding": "inplace", "label": "uint256", "numberOfBytes": "32" },
                    "t_uint128": { "encoding": "inplace", "label": "uint128", "numberOfBytes": "16" },
                },
            },
        })
        .to_string()
    }

    #[test]
    fn test_build_from_json() {
        let json = artifact_json(
            "0x6080604052",
            &[("owner", "address", 0, 0), ("paused", "bool", 0, 20), ("feeBps", "uint256", 1, 0)],
        );
        let version = ArtifactBuilder
            .build(&ModuleSource::from_json(1u64, json))
            .unwrap();

        assert_eq!(version.name, "ASC20Market");
        assert_eq!(version.identifier, VersionId::Number(1));
        assert_eq!(version.bytecode.as_ref(), &[0x60, 0x80, 0x60, 0x40, 0x52]);
        let names: Vec<_> = version.layout.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["owner", "paused", "feeBps"]);
        assert_eq!(version.layout.fields[1].byte_width, 1);
        assert_eq!(version.layout.fields[1].offset, 20);
        assert_eq!(version.layout.fields[2].type_tag, "uint256");
    }

    #[test]
    fn test_build_from_path() {
        let dir = tempdir::TempDir::new("proxyup-test").unwrap();
        let path = dir.path().join("ASC20Market.json");
        std::fs::write(&path, artifact_json("0x00", &[("owner", "address", 0, 0)])).unwrap();

        let version = ArtifactBuilder
            .build(&ModuleSource::from_path("1.0.0", &path))
            .unwrap();
        assert_eq!(version.identifier, VersionId::Semantic("1.0.0".to_string()));
    }

    #[test]
    fn test_digest_is_deterministic() {
        let json = artifact_json("0x6080", &[("owner", "address", 0, 0)]);
        let a = ArtifactBuilder.build(&ModuleSource::from_json(1u64, json.clone())).unwrap();
        let b = ArtifactBuilder.build(&ModuleSource::from_json(1u64, json)).unwrap();
        assert_eq!(a.digest, b.digest);
        assert_eq!(a.digest.len(), 64);

        let other = artifact_json("0x6081", &[("owner", "address", 0, 0)]);
        let c = ArtifactBuilder.build(&ModuleSource::from_json(1u64, other)).unwrap();
        assert_ne!(a.digest, c.digest);
    }

    #[test]
    fn test_missing_bytecode() {
        let json = artifact_json("0x", &[("owner", "address", 0, 0)]);
        let err = ArtifactBuilder.build(&ModuleSource::from_json(1u64, json)).unwrap_err();
        assert!(matches!(err, BuildError::MissingBytecode));
    }

    #[test]
    fn test_unlinked_bytecode() {
        let json = artifact_json("0x6080__$abcdef$__6080", &[]);
        let err = ArtifactBuilder.build(&ModuleSource::from_json(1u64, json)).unwrap_err();
        assert!(matches!(err, BuildError::UnlinkedBytecode));
    }

    #[test]
    fn test_missing_storage_layout() {
        let json = serde_json::json!({ "contractName": "X", "bytecode": "0x00" }).to_string();
        let err = ArtifactBuilder.build(&ModuleSource::from_json(1u64, json)).unwrap_err();
        assert!(matches!(err, BuildError::MissingStorageLayout));
    }

    #[test]
    fn test_unknown_type() {
        let json = artifact_json("0x00", &[("owner", "address32", 0, 0)]);
        let err = ArtifactBuilder.build(&ModuleSource::from_json(1u64, json)).unwrap_err();
        assert!(matches!(err, BuildError::UnknownType { .. }));
    }

    #[test]
    fn test_overlapping_fields() {
        let json = artifact_json("0x00", &[("a", "uint256", 0, 0), ("b", "bool", 0, 31)]);
        let err = ArtifactBuilder.build(&ModuleSource::from_json(1u64, json)).unwrap_err();
        assert!(matches!(err, BuildError::OverlappingFields { .. }));
    }

    #[test]
    fn test_invalid_json() {
        let err = ArtifactBuilder
            .build(&ModuleSource::from_json(1u64, "{ invalid json }"))
            .unwrap_err();
        assert!(matches!(err, BuildError::Parse(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = ArtifactBuilder
            .build(&ModuleSource::from_path(1u64, "/nonexistent/artifact.json"))
            .unwrap_err();
        assert!(matches!(err, BuildError::Read { .. }));
    }
}
