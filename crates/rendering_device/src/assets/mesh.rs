//! Mesh data and upload

use log::{debug, warn};

use super::AssetError;
use crate::render::driver::RenderingDeviceDriver;
use crate::render::error::DriverResult;
use crate::render::flags::BufferUsage;
use crate::render::resources::Buffer;
use crate::render::types::BufferDescription;

/// Triangle mesh with optional per-vertex attributes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    /// Vertex positions
    pub positions: Vec<[f32; 3]>,
    /// Vertex normals
    pub normals: Option<Vec<[f32; 3]>>,
    /// Texture coordinates
    pub uvs: Option<Vec<[f32; 2]>>,
    /// Vertex colors
    pub colors: Option<Vec<[f32; 3]>>,
    /// Triangle list indices
    pub indices: Vec<u32>,
}

impl MeshData {
    /// Build a triangle mesh from polygon faces
    ///
    /// `arities` gives the vertex count of each face in `indices`; an empty
    /// slice means every face is a triangle. Faces that are not triangles are
    /// skipped with a warning. Indices outside `positions` are an error.
    pub fn from_faces(
        positions: Vec<[f32; 3]>,
        indices: &[u32],
        arities: &[u32],
    ) -> Result<Self, AssetError> {
        if let Some(index) = indices.iter().find(|&&i| i as usize >= positions.len()) {
            return Err(AssetError::InvalidMesh(format!(
                "index {index} outside {} vertices",
                positions.len()
            )));
        }

        let triangles = if arities.is_empty() {
            if indices.len() % 3 != 0 {
                return Err(AssetError::InvalidMesh(format!(
                    "{} indices do not form whole triangles",
                    indices.len()
                )));
            }
            indices.to_vec()
        } else {
            let total: usize = arities.iter().map(|&a| a as usize).sum();
            if total != indices.len() {
                return Err(AssetError::InvalidMesh(format!(
                    "face arities cover {total} indices, mesh has {}",
                    indices.len()
                )));
            }
            let mut triangles = Vec::with_capacity(indices.len());
            let mut skipped = 0usize;
            let mut start = 0usize;
            for &arity in arities {
                let end = start + arity as usize;
                if arity == 3 {
                    triangles.extend_from_slice(&indices[start..end]);
                } else {
                    skipped += 1;
                }
                start = end;
            }
            if skipped > 0 {
                warn!("Skipped {skipped} non-triangular face(s)");
            }
            triangles
        };

        Ok(Self {
            positions,
            indices: triangles,
            ..Self::default()
        })
    }

    /// Attach normals, one per vertex
    pub fn with_normals(mut self, normals: Vec<[f32; 3]>) -> Result<Self, AssetError> {
        self.check_attribute("normals", normals.len())?;
        self.normals = Some(normals);
        Ok(self)
    }

    /// Attach texture coordinates, one per vertex
    pub fn with_uvs(mut self, uvs: Vec<[f32; 2]>) -> Result<Self, AssetError> {
        self.check_attribute("uvs", uvs.len())?;
        self.uvs = Some(uvs);
        Ok(self)
    }

    /// Attach colors, one per vertex
    pub fn with_colors(mut self, colors: Vec<[f32; 3]>) -> Result<Self, AssetError> {
        self.check_attribute("colors", colors.len())?;
        self.colors = Some(colors);
        Ok(self)
    }

    fn check_attribute(&self, name: &str, len: usize) -> Result<(), AssetError> {
        if len == self.positions.len() {
            Ok(())
        } else {
            Err(AssetError::InvalidMesh(format!(
                "{len} {name} for {} vertices",
                self.positions.len()
            )))
        }
    }

    /// Number of vertices
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    /// Number of triangles
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Floats per interleaved vertex
    pub fn floats_per_vertex(&self) -> usize {
        3 + self.normals.as_ref().map_or(0, |_| 3)
            + self.uvs.as_ref().map_or(0, |_| 2)
            + self.colors.as_ref().map_or(0, |_| 3)
    }

    /// Vertices interleaved as position, normal, uv, color
    pub fn interleaved(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.vertex_count() * self.floats_per_vertex());
        for (i, position) in self.positions.iter().enumerate() {
            out.extend_from_slice(position);
            if let Some(normals) = &self.normals {
                out.extend_from_slice(&normals[i]);
            }
            if let Some(uvs) = &self.uvs {
                out.extend_from_slice(&uvs[i]);
            }
            if let Some(colors) = &self.colors {
                out.extend_from_slice(&colors[i]);
            }
        }
        out
    }
}

/// Device buffers holding one uploaded mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshBuffers {
    /// Interleaved vertex data
    pub vertex: Buffer,
    /// `u32` triangle indices
    pub index: Buffer,
    /// Number of indices
    pub index_count: u32,
    /// Bytes per vertex
    pub vertex_stride: u32,
}

impl MeshBuffers {
    /// Release both buffers
    pub fn destroy(self, driver: &mut dyn RenderingDeviceDriver) {
        driver.destroy_buffer(self.vertex.id);
        driver.destroy_buffer(self.index.id);
    }
}

/// Create host-visible vertex and index buffers for `mesh` and fill them
pub fn upload_mesh(
    driver: &mut dyn RenderingDeviceDriver,
    mesh: &MeshData,
) -> DriverResult<MeshBuffers> {
    let vertices = mesh.interleaved();
    let vertex = driver.create_buffer(&BufferDescription::new(
        BufferUsage::VERTEX | BufferUsage::COPY_SOURCE,
        vertices.len() as u64,
        4,
    ))?;
    let index = match driver.create_buffer(&BufferDescription::new(
        BufferUsage::INDEX | BufferUsage::COPY_SOURCE,
        mesh.indices.len() as u64,
        4,
    )) {
        Ok(index) => index,
        Err(e) => {
            driver.destroy_buffer(vertex.id);
            return Err(e);
        }
    };

    let written = driver
        .write_buffer(&vertex, 0, bytemuck::cast_slice(&vertices))
        .and_then(|()| driver.write_buffer(&index, 0, bytemuck::cast_slice(&mesh.indices)));
    if let Err(e) = written {
        driver.destroy_buffer(vertex.id);
        driver.destroy_buffer(index.id);
        return Err(e);
    }

    debug!(
        "Uploaded mesh: {} vertices, {} triangles",
        mesh.vertex_count(),
        mesh.triangle_count()
    );
    Ok(MeshBuffers {
        vertex,
        index,
        index_count: mesh.indices.len() as u32,
        vertex_stride: (mesh.floats_per_vertex() * 4) as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::render::backends::HeadlessDriver;

    fn quad_positions() -> Vec<[f32; 3]> {
        vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [1.0, 1.0, 0.0],
            [0.0, 1.0, 0.0],
        ]
    }

    #[test]
    fn test_non_triangular_faces_are_skipped() {
        // One quad followed by one triangle
        let indices = [0, 1, 2, 3, 0, 2, 3];
        let mesh = MeshData::from_faces(quad_positions(), &indices, &[4, 3]).unwrap();

        assert_eq!(mesh.indices, vec![0, 2, 3]);
        assert_eq!(mesh.triangle_count(), 1);
    }

    #[test]
    fn test_invalid_faces_are_rejected() {
        assert!(MeshData::from_faces(quad_positions(), &[0, 1, 4], &[]).is_err());
        assert!(MeshData::from_faces(quad_positions(), &[0, 1], &[]).is_err());
        assert!(MeshData::from_faces(quad_positions(), &[0, 1, 2], &[4]).is_err());
    }

    #[test]
    fn test_attributes_must_match_vertex_count() {
        let mesh = MeshData::from_faces(quad_positions(), &[0, 1, 2, 0, 2, 3], &[]).unwrap();
        assert!(mesh.clone().with_uvs(vec![[0.0, 0.0]; 3]).is_err());

        let mesh = mesh.with_uvs(vec![[0.5, 0.5]; 4]).unwrap();
        assert_eq!(mesh.floats_per_vertex(), 5);
        assert_eq!(&mesh.interleaved()[5..10], &[1.0, 0.0, 0.0, 0.5, 0.5]);
    }

    #[test]
    fn test_upload_writes_both_buffers() {
        let mut driver = HeadlessDriver::new(&DriverConfig::default()).unwrap();
        let mesh = MeshData::from_faces(quad_positions(), &[0, 1, 2, 0, 2, 3], &[]).unwrap();

        let buffers = upload_mesh(&mut driver, &mesh).unwrap();
        assert_eq!(buffers.vertex.size(), 48);
        assert_eq!(buffers.index_count, 6);
        assert_eq!(buffers.vertex_stride, 12);

        let mut indices = [0u32; 6];
        driver
            .read_buffer(&buffers.index, 0, bytemuck::cast_slice_mut(&mut indices))
            .unwrap();
        assert_eq!(indices, [0, 1, 2, 0, 2, 3]);

        buffers.destroy(&mut driver);
        assert_eq!(driver.memory_used(), 0);
    }
}
