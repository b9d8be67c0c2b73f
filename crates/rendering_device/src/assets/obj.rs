//! OBJ file importer

use std::path::Path;

use log::debug;

use super::{AssetError, MeshData, MeshImporter};

/// Wavefront OBJ importer
///
/// Faces are loaded as written. Only triangles are kept; quads and larger
/// polygons are dropped by [`MeshData::from_faces`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjImporter;

impl ObjImporter {
    fn load_options() -> tobj::LoadOptions {
        tobj::LoadOptions {
            triangulate: false,
            single_index: true,
            ..Default::default()
        }
    }

    fn convert(path: &Path, models: Vec<tobj::Model>) -> Result<MeshData, AssetError> {
        let model = models
            .into_iter()
            .next()
            .ok_or_else(|| AssetError::InvalidMesh(format!("{} contains no models", path.display())))?;
        let mesh = model.mesh;

        let positions = mesh.positions.chunks_exact(3).map(|p| [p[0], p[1], p[2]]).collect();
        let mut data = MeshData::from_faces(positions, &mesh.indices, &mesh.face_arities)?;
        if !mesh.normals.is_empty() {
            data = data.with_normals(mesh.normals.chunks_exact(3).map(|n| [n[0], n[1], n[2]]).collect())?;
        }
        if !mesh.texcoords.is_empty() {
            data = data.with_uvs(mesh.texcoords.chunks_exact(2).map(|t| [t[0], t[1]]).collect())?;
        }
        if !mesh.vertex_color.is_empty() {
            data = data.with_colors(mesh.vertex_color.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect())?;
        }

        debug!(
            "Imported '{}' from {}: {} vertices, {} triangles",
            model.name,
            path.display(),
            data.vertex_count(),
            data.triangle_count()
        );
        Ok(data)
    }
}

impl MeshImporter for ObjImporter {
    fn import(&self, path: &Path) -> Result<MeshData, AssetError> {
        let (models, _materials) =
            tobj::load_obj(path, &Self::load_options()).map_err(|e| match e {
                tobj::LoadError::OpenFileFailed => AssetError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("cannot open {}", path.display()),
                )),
                other => AssetError::Parse {
                    path: path.to_path_buf(),
                    reason: other.to_string(),
                },
            })?;
        Self::convert(path, models)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_import_keeps_triangles_only() {
        let mut file = tempfile::Builder::new().suffix(".obj").tempfile().unwrap();
        writeln!(
            file,
            "v 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\nf 1 2 3\nf 1 2 3 4\n"
        )
        .unwrap();

        let mesh = ObjImporter.import(file.path()).unwrap();
        assert_eq!(mesh.vertex_count(), 4);
        assert_eq!(mesh.triangle_count(), 1);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = ObjImporter.import(Path::new("does/not/exist.obj"));
        assert!(matches!(result, Err(AssetError::Io(_))));
    }
}
