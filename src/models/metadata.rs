use serde::{Deserialize, Serialize};

/// One node of the converted mesh's scene hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: usize,
    pub name: String,
    #[serde(rename = "mesh", skip_serializing_if = "Option::is_none")]
    pub mesh_index: Option<usize>,
    #[serde(rename = "children", skip_serializing_if = "Option::is_none")]
    pub child_ids: Option<Vec<usize>>,
}

/// Component metadata extracted from a converted mesh.
///
/// A degraded extraction carries `error` and an empty node list.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MeshMetadata {
    pub node_count: usize,
    #[serde(rename = "meshes_count")]
    pub mesh_count: usize,
    #[serde(rename = "materials_count")]
    pub material_count: usize,
    pub nodes: Vec<NodeInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MeshMetadata {
    pub fn degraded(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }
}

/// Return value of a successful conversion task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversionOutput {
    pub render_url: String,
    pub metadata: MeshMetadata,
}
