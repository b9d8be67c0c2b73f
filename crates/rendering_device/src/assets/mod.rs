//! Asset collaborators
//!
//! Importers turn files into [`MeshData`]; [`upload_mesh`] moves that data
//! into driver buffers and [`MeshCache`] deduplicates uploads by path.

pub mod mesh;
#[cfg(feature = "obj")]
pub mod obj;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::foundation::KeyedCache;
use crate::render::driver::RenderingDeviceDriver;
use crate::render::error::DriverError;

pub use mesh::{upload_mesh, MeshBuffers, MeshData};
#[cfg(feature = "obj")]
pub use obj::ObjImporter;

/// Asset loading errors
#[derive(Error, Debug)]
pub enum AssetError {
    /// File could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// File contents could not be parsed
    #[error("Parse error in {path}: {reason}")]
    Parse {
        /// File being parsed
        path: PathBuf,
        /// Parser message
        reason: String,
    },

    /// Parsed data does not describe a valid mesh
    #[error("Invalid mesh: {0}")]
    InvalidMesh(String),

    /// Upload to the device failed
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),
}

/// Something that produces mesh data from a file
pub trait MeshImporter {
    /// Import the mesh stored at `path`
    fn import(&self, path: &Path) -> Result<MeshData, AssetError>;
}

/// Uploaded meshes keyed by source path
pub type MeshCache = KeyedCache<PathBuf, MeshBuffers>;

/// Import and upload `path` unless it is already cached
pub fn load_mesh(
    cache: &MeshCache,
    driver: &mut dyn RenderingDeviceDriver,
    importer: &dyn MeshImporter,
    path: &Path,
) -> Result<Arc<MeshBuffers>, AssetError> {
    cache.get_or_load(&path.to_path_buf(), |path| {
        let data = importer.import(path)?;
        Ok(upload_mesh(driver, &data)?)
    })
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::config::DriverConfig;
    use crate::render::backends::HeadlessDriver;

    struct CountingImporter {
        imports: Cell<u32>,
    }

    impl MeshImporter for CountingImporter {
        fn import(&self, _path: &Path) -> Result<MeshData, AssetError> {
            self.imports.set(self.imports.get() + 1);
            MeshData::from_faces(
                vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
                &[0, 1, 2],
                &[],
            )
        }
    }

    #[test]
    fn test_load_mesh_uploads_once() {
        let mut driver = HeadlessDriver::new(&DriverConfig::default()).unwrap();
        let cache = MeshCache::new();
        let importer = CountingImporter {
            imports: Cell::new(0),
        };
        let path = Path::new("meshes/triangle.obj");

        let first = load_mesh(&cache, &mut driver, &importer, path).unwrap();
        let second = load_mesh(&cache, &mut driver, &importer, path).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(importer.imports.get(), 1);
        assert_eq!(first.index_count, 3);
    }
}
