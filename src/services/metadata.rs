//! Component metadata extraction from converted GLB meshes.

use serde::Deserialize;
use std::path::Path;

use crate::models::metadata::{MeshMetadata, NodeInfo};

const GLB_MAGIC: u32 = 0x4654_6C67; // "glTF"
const GLB_VERSION: u32 = 2;
const CHUNK_JSON: u32 = 0x4E4F_534A; // "JSON"
const HEADER_LEN: usize = 12;
const CHUNK_HEADER_LEN: usize = 8;

/// Reads scene structure out of a converted mesh.
///
/// Never fails: malformed input yields a degraded payload.
pub trait MetadataExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> MeshMetadata;
}

/// Extractor for binary glTF (and plain JSON glTF) files.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlbMetadataExtractor;

#[derive(Debug, Deserialize)]
struct GltfDocument {
    #[serde(default)]
    nodes: Vec<GltfNode>,
    #[serde(default)]
    meshes: Vec<serde_json::Value>,
    #[serde(default)]
    materials: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GltfNode {
    name: Option<String>,
    mesh: Option<usize>,
    #[serde(default)]
    children: Vec<usize>,
}

#[derive(Debug, thiserror::Error)]
enum ParseError {
    #[error("failed to read mesh file: {0}")]
    Io(#[from] std::io::Error),

    #[error("file is too short to be a GLB container")]
    Truncated,

    #[error("bad GLB magic {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported GLB version {0}")]
    UnsupportedVersion(u32),

    #[error("first GLB chunk is not JSON (type {0:#010x})")]
    MissingJsonChunk(u32),

    #[error("invalid glTF JSON: {0}")]
    Json(#[from] serde_json::Error),
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, ParseError> {
    let slice = bytes
        .get(offset..offset + 4)
        .ok_or(ParseError::Truncated)?;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn json_chunk(bytes: &[u8]) -> Result<&[u8], ParseError> {
    // Plain .gltf documents are JSON from the first byte
    if bytes.first() == Some(&b'{') {
        return Ok(bytes);
    }

    let magic = read_u32(bytes, 0)?;
    if magic != GLB_MAGIC {
        return Err(ParseError::BadMagic(magic));
    }
    let version = read_u32(bytes, 4)?;
    if version != GLB_VERSION {
        return Err(ParseError::UnsupportedVersion(version));
    }

    let chunk_len = read_u32(bytes, HEADER_LEN)? as usize;
    let chunk_type = read_u32(bytes, HEADER_LEN + 4)?;
    if chunk_type != CHUNK_JSON {
        return Err(ParseError::MissingJsonChunk(chunk_type));
    }

    let start = HEADER_LEN + CHUNK_HEADER_LEN;
    bytes
        .get(start..start + chunk_len)
        .ok_or(ParseError::Truncated)
}

fn parse(bytes: &[u8]) -> Result<MeshMetadata, ParseError> {
    let document: GltfDocument = serde_json::from_slice(json_chunk(bytes)?)?;

    let nodes: Vec<NodeInfo> = document
        .nodes
        .into_iter()
        .enumerate()
        .map(|(id, node)| NodeInfo {
            id,
            name: node
                .name
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| format!("node_{id}")),
            mesh_index: node.mesh,
            child_ids: (!node.children.is_empty()).then_some(node.children),
        })
        .collect();

    Ok(MeshMetadata {
        node_count: nodes.len(),
        mesh_count: document.meshes.len(),
        material_count: document.materials.len(),
        nodes,
        error: None,
    })
}

impl GlbMetadataExtractor {
    pub fn extract_bytes(&self, bytes: &[u8]) -> MeshMetadata {
        parse(bytes).unwrap_or_else(|e| MeshMetadata::degraded(e.to_string()))
    }
}

impl MetadataExtractor for GlbMetadataExtractor {
    fn extract(&self, path: &Path) -> MeshMetadata {
        match std::fs::read(path) {
            Ok(bytes) => self.extract_bytes(&bytes),
            Err(e) => MeshMetadata::degraded(ParseError::Io(e).to_string()),
        }
    }
}
