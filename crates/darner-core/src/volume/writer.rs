use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;

use crate::compress::Codec;
use crate::error::{DarnerError, Result};

use super::payload::{
    write_payload, BlockRecord, BlocklistRecord, BlocksPayload, FileRecord, FilesetPayload,
    IndexPayload, IndexVolumeEntry,
};

/// A finished volume: local bytes ready for upload.
///
/// The temp file lives exactly as long as this value; dropping it releases
/// the local bytes on every exit path.
pub struct ClosedVolume {
    pub remote_name: String,
    pub size: i64,
    file: NamedTempFile,
}

impl ClosedVolume {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

fn close_into_temp<T: serde::Serialize>(
    remote_name: String,
    codec: Codec,
    payload: &T,
) -> Result<ClosedVolume> {
    let mut file = NamedTempFile::new()?;
    write_payload(payload, codec, file.as_file_mut())?;
    file.as_file_mut().flush()?;
    let size = file.as_file().metadata()?.len() as i64;
    Ok(ClosedVolume {
        remote_name,
        size,
        file,
    })
}

/// Buffers blocks for a Blocks volume and closes them into a temp file.
pub struct BlockVolumeWriter {
    remote_name: String,
    codec: Codec,
    payload: BlocksPayload,
}

impl BlockVolumeWriter {
    pub fn new(remote_name: impl Into<String>, codec: Codec) -> Self {
        Self {
            remote_name: remote_name.into(),
            codec,
            payload: BlocksPayload::default(),
        }
    }

    pub fn set_remote_name(&mut self, name: impl Into<String>) {
        self.remote_name = name.into();
    }

    pub fn append_block(&mut self, hash: impl Into<String>, data: Vec<u8>) {
        self.payload.blocks.push(BlockRecord {
            hash: hash.into(),
            data,
        });
    }

    pub fn block_count(&self) -> usize {
        self.payload.blocks.len()
    }

    pub fn close(self) -> Result<ClosedVolume> {
        close_into_temp(self.remote_name, self.codec, &self.payload)
    }
}

/// Builds an Index volume as a sequence of start/add/finish triples plus
/// optional blocklist payloads.
pub struct IndexVolumeWriter {
    remote_name: String,
    codec: Codec,
    payload: IndexPayload,
    current: Option<IndexVolumeEntry>,
}

impl IndexVolumeWriter {
    pub fn new(remote_name: impl Into<String>, codec: Codec) -> Self {
        Self {
            remote_name: remote_name.into(),
            codec,
            payload: IndexPayload::default(),
            current: None,
        }
    }

    pub fn start_volume(&mut self, volume_name: impl Into<String>, hash: impl Into<String>, size: i64) {
        self.finish_volume();
        self.current = Some(IndexVolumeEntry {
            volume_name: volume_name.into(),
            volume_hash: hash.into(),
            volume_size: size,
            blocks: Vec::new(),
        });
    }

    pub fn add_block(&mut self, hash: impl Into<String>, size: i64) -> Result<()> {
        match self.current.as_mut() {
            Some(entry) => {
                entry.blocks.push((hash.into(), size));
                Ok(())
            }
            None => Err(DarnerError::Other(
                "add_block called outside start_volume/finish_volume".into(),
            )),
        }
    }

    pub fn finish_volume(&mut self) {
        if let Some(entry) = self.current.take() {
            self.payload.volumes.push(entry);
        }
    }

    pub fn write_blocklist(&mut self, hash: impl Into<String>, data: Vec<u8>) {
        self.payload.blocklists.push(BlocklistRecord {
            hash: hash.into(),
            data,
        });
    }

    pub fn close(mut self) -> Result<ClosedVolume> {
        self.finish_volume();
        close_into_temp(self.remote_name, self.codec, &self.payload)
    }
}

/// Serializes one snapshot manifest into a Files volume.
pub struct FilesetVolumeWriter {
    remote_name: String,
    codec: Codec,
    payload: FilesetPayload,
}

impl FilesetVolumeWriter {
    pub fn new(
        remote_name: impl Into<String>,
        codec: Codec,
        time: DateTime<Utc>,
        is_full_backup: bool,
    ) -> Self {
        Self {
            remote_name: remote_name.into(),
            codec,
            payload: FilesetPayload {
                time,
                is_full_backup,
                files: Vec::new(),
                control_files: Vec::new(),
            },
        }
    }

    pub fn add_file(&mut self, record: FileRecord) {
        self.payload.files.push(record);
    }

    pub fn add_control_file(&mut self, name: impl Into<String>, data: Vec<u8>) {
        self.payload.control_files.push((name.into(), data));
    }

    pub fn close(self) -> Result<ClosedVolume> {
        close_into_temp(self.remote_name, self.codec, &self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::payload::{read_payload, FileType};
    use chrono::TimeZone;

    #[test]
    fn block_writer_roundtrip() {
        let mut writer = BlockVolumeWriter::new("darner-b.zstd", Codec::Zstd);
        writer.append_block("h1", vec![1, 2, 3]);
        writer.append_block("h2", vec![4, 5]);
        assert_eq!(writer.block_count(), 2);

        let closed = writer.close().unwrap();
        assert!(closed.size > 0);
        let payload: BlocksPayload = read_payload(closed.path()).unwrap();
        assert_eq!(payload.blocks.len(), 2);
        assert_eq!(payload.blocks[1].hash, "h2");
    }

    #[test]
    fn index_writer_requires_open_volume() {
        let mut writer = IndexVolumeWriter::new("darner-i.zstd", Codec::None);
        assert!(writer.add_block("h", 10).is_err());
        writer.start_volume("vol-a", "hash-a", 100);
        assert!(writer.add_block("h", 10).is_ok());
    }

    #[test]
    fn index_writer_close_finishes_open_volume() {
        let mut writer = IndexVolumeWriter::new("darner-i.zstd", Codec::Lz4);
        writer.start_volume("vol-a", "hash-a", 100);
        writer.add_block("h1", 10).unwrap();
        writer.write_blocklist("bl", vec![0u8; 64]);

        let closed = writer.close().unwrap();
        let payload: IndexPayload = read_payload(closed.path()).unwrap();
        assert_eq!(payload.volumes.len(), 1);
        assert_eq!(payload.volumes[0].blocks, vec![("h1".to_string(), 10)]);
        assert_eq!(payload.blocklists.len(), 1);
    }

    #[test]
    fn fileset_writer_carries_control_files() {
        let time = chrono::Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let mut writer = FilesetVolumeWriter::new("darner-f.zstd", Codec::Zstd, time, true);
        writer.add_file(FileRecord {
            path: "/a.txt".into(),
            file_type: FileType::File,
            size: 3,
            meta_hash: "m".into(),
            metadata: vec![1],
            block_hashes: vec!["h1".into()],
            blocklist_hash: None,
        });
        writer.add_control_file("settings.json", b"{}".to_vec());

        let closed = writer.close().unwrap();
        let payload: FilesetPayload = read_payload(closed.path()).unwrap();
        assert_eq!(payload.time, time);
        assert!(payload.is_full_backup);
        assert_eq!(payload.files.len(), 1);
        assert_eq!(payload.control_files.len(), 1);
    }
}
