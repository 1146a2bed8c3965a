//! Series container: one gzip-compressed tar file per series
//!
//! Each instance becomes a single entry named `<instance_id>.dcm`. Payloads
//! are copied through a fixed-size buffer, so writing never holds more than
//! one chunk of an instance in memory.

use crate::error::ContainerError;
use crate::layout::is_valid_component;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

/// Extension given to each instance entry
pub const ENTRY_EXTENSION: &str = ".dcm";

/// Entry name for an instance
pub fn entry_name(instance_id: &str) -> Result<String, ContainerError> {
    if is_valid_component(instance_id) {
        Ok(format!("{}{}", instance_id, ENTRY_EXTENSION))
    } else {
        Err(ContainerError::InvalidInstanceId(instance_id.to_string()))
    }
}

/// Streaming tar.gz writer
pub struct ContainerWriter {
    path: PathBuf,
    builder: tar::Builder<GzEncoder<BufWriter<File>>>,
    mtime: u64,
    entries: usize,
}

impl ContainerWriter {
    /// Create (or truncate) a container at `path`
    ///
    /// `mtime` is stamped on every entry (Unix seconds).
    pub fn create(path: &Path, mtime: u64) -> Result<Self, ContainerError> {
        let file = File::create(path).map_err(|e| ContainerError::io(path, e))?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.mode(tar::HeaderMode::Deterministic);

        Ok(Self {
            path: path.to_path_buf(),
            builder,
            mtime,
            entries: 0,
        })
    }

    /// Append one instance payload of exactly `len` bytes
    pub fn append_instance<R: Read>(
        &mut self,
        instance_id: &str,
        len: u64,
        reader: R,
    ) -> Result<(), ContainerError> {
        let name = entry_name(instance_id)?;

        let mut header = tar::Header::new_gnu();
        header.set_size(len);
        header.set_mode(0o644);
        header.set_mtime(self.mtime);
        header.set_entry_type(tar::EntryType::Regular);

        let mut counted = CountingReader::new(reader.take(len));
        self.builder
            .append_data(&mut header, &name, &mut counted)
            .map_err(|e| ContainerError::io(&self.path, e))?;

        if counted.count != len {
            return Err(ContainerError::Truncated {
                entry: name,
                expected: len,
                actual: counted.count,
            });
        }

        self.entries += 1;
        Ok(())
    }

    /// Number of entries appended so far
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Write the tar trailer, finish the gzip stream and fsync the file
    pub fn finish(self) -> Result<PathBuf, ContainerError> {
        let path = self.path;
        let encoder = self
            .builder
            .into_inner()
            .map_err(|e| ContainerError::io(&path, e))?;
        let buffered = encoder.finish().map_err(|e| ContainerError::io(&path, e))?;
        let file = buffered
            .into_inner()
            .map_err(|e| ContainerError::io(&path, e.into_error()))?;
        file.sync_all().map_err(|e| ContainerError::io(&path, e))?;
        Ok(path)
    }
}

/// Reader over a finished container
pub struct ContainerReader {
    path: PathBuf,
}

impl ContainerReader {
    pub fn open(path: &Path) -> Result<Self, ContainerError> {
        if !path.is_file() {
            return Err(ContainerError::io(path, io::ErrorKind::NotFound.into()));
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Visit every entry in order with its instance id and payload
    pub fn for_each_instance<F>(&self, mut visit: F) -> Result<(), ContainerError>
    where
        F: FnMut(&str, &mut dyn Read) -> io::Result<()>,
    {
        let file = File::open(&self.path).map_err(|e| ContainerError::io(&self.path, e))?;
        let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));

        let entries = archive
            .entries()
            .map_err(|e| ContainerError::io(&self.path, e))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| ContainerError::io(&self.path, e))?;
            let name = entry
                .path()
                .map_err(|e| ContainerError::io(&self.path, e))?
                .to_string_lossy()
                .into_owned();
            let instance_id = name.strip_suffix(ENTRY_EXTENSION).unwrap_or(&name).to_string();
            visit(&instance_id, &mut entry).map_err(|e| ContainerError::io(&self.path, e))?;
        }

        Ok(())
    }

    /// Instance ids held by the container, in archive order
    pub fn instance_ids(&self) -> Result<Vec<String>, ContainerError> {
        let mut ids = Vec::new();
        self.for_each_instance(|id, payload| {
            // Drain so the gzip CRC of every member is checked
            io::copy(payload, &mut io::sink())?;
            ids.push(id.to_string());
            Ok(())
        })?;
        Ok(ids)
    }

    /// Check the container holds exactly `expected`, each once
    ///
    /// Returns the number of entries.
    pub fn verify(&self, expected: &[String]) -> Result<usize, ContainerError> {
        let found = self.instance_ids()?;

        if found.is_empty() {
            return Err(self.mismatch("container is empty".to_string()));
        }

        let mut seen = HashSet::with_capacity(found.len());
        for id in &found {
            if !seen.insert(id.as_str()) {
                return Err(self.mismatch(format!("instance {} appears twice", id)));
            }
        }

        let wanted: HashSet<&str> = expected.iter().map(String::as_str).collect();
        if let Some(extra) = seen.difference(&wanted).next() {
            return Err(self.mismatch(format!("unexpected instance {}", extra)));
        }
        if let Some(missing) = wanted.difference(&seen).next() {
            return Err(self.mismatch(format!("missing instance {}", missing)));
        }

        Ok(found.len())
    }

    fn mismatch(&self, reason: String) -> ContainerError {
        ContainerError::Mismatch {
            path: self.path.clone(),
            reason,
        }
    }
}

struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R> CountingReader<R> {
    fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}
