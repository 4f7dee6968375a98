use std::fmt;
use std::io;
use std::path::Path;

use tokio::fs::File;

use crate::{etag, RangeReadable, ResourceDescriptor};

/// An open file together with what range negotiation needs to know about it.
pub struct FileResource {
    file: File,
    descriptor: ResourceDescriptor,
    content_type: Option<String>,
}

impl fmt::Debug for FileResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileResource")
            .field("descriptor", &self.descriptor)
            .field("content_type", &self.content_type)
            .finish()
    }
}

impl FileResource {
    /// Opens `path`, stats it and guesses a content type from its extension.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<FileResource> {
        let path = path.as_ref();
        let file = File::open(path).await?;
        let mut resource = FileResource::from_file(file).await?;
        resource.content_type = mime_guess::from_path(path)
            .first_raw()
            .map(str::to_string);
        Ok(resource)
    }

    /// Calls [`tokio::fs::File::metadata`] to determine size and modification time.
    pub async fn from_file(file: File) -> io::Result<FileResource> {
        let metadata = file.metadata().await?;
        if metadata.is_dir() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "cannot serve ranges of a directory"));
        }
        let descriptor = ResourceDescriptor::from_metadata(&metadata);
        Ok(FileResource { file, descriptor, content_type: None })
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn descriptor(&self) -> ResourceDescriptor {
        self.descriptor
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Weak entity tag from size and modification time.
    pub fn etag(&self) -> Option<String> {
        etag::calculate_weak(&self.descriptor)
    }

    pub fn into_parts(self) -> (RangeReadable, ResourceDescriptor, Option<String>) {
        (RangeReadable::from(self.file), self.descriptor, self.content_type)
    }
}
