// ========================================================================================
//
//                             Chunked chromosome store
//
// ========================================================================================
//
// One file per contig. Buckets are appended in strictly ascending id order as deflate
// payloads; sealing appends a directory footer. A file is readable only once its footer
// and trailing magic are present, so a crash mid-ingestion never yields a store that
// silently lacks buckets.
//
//   header : "VMSK" | u16 version | u64 patient_count | u32 len | contig bytes
//   bucket : deflate(u32 count | { u32 pos | u32 len | ref | u32 len | alt | u8 classes
//                                  | words... } * count)
//   footer : u32 n | { u32 bucket | u64 offset | u64 length } * n | u64 footer_offset
//            | "KSMV"

use crate::error::{IoContext, StoreError};
use crate::mask::{Bucket, MaskRecord, PatientMask, words_for};
use crate::variant::{MaskClass, VariantKey};
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use log::debug;
use memmap2::Mmap;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const HEADER_MAGIC: &[u8; 4] = b"VMSK";
const TRAILER_MAGIC: &[u8; 4] = b"KSMV";
const FORMAT_VERSION: u16 = 1;
const TRAILER_LEN: usize = 8 + TRAILER_MAGIC.len();
const DIRECTORY_ENTRY_LEN: usize = 4 + 8 + 8;

#[derive(Debug, Clone, Copy)]
struct BucketExtent {
    offset: u64,
    length: u64,
}

/// Append-only writer for one contig. Only the ingestion or merge run that created it
/// may write to it.
pub struct ChunkedStoreWriter {
    path: PathBuf,
    contig: Arc<str>,
    patient_count: usize,
    writer: BufWriter<File>,
    offset: u64,
    directory: Vec<(u32, BucketExtent)>,
    last_bucket: Option<u32>,
    compression: Compression,
}

impl ChunkedStoreWriter {
    pub fn create(
        path: &Path,
        contig: &str,
        patient_count: usize,
        compression: Compression,
    ) -> Result<Self, StoreError> {
        let file = File::create(path).at(path)?;
        let mut writer = BufWriter::new(file);

        let mut header = Vec::with_capacity(18 + contig.len());
        header.extend_from_slice(HEADER_MAGIC);
        header.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        header.extend_from_slice(&(patient_count as u64).to_le_bytes());
        header.extend_from_slice(&(contig.len() as u32).to_le_bytes());
        header.extend_from_slice(contig.as_bytes());
        writer.write_all(&header).at(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            contig: Arc::from(contig),
            patient_count,
            writer,
            offset: header.len() as u64,
            directory: Vec::new(),
            last_bucket: None,
            compression,
        })
    }

    pub fn contig(&self) -> &str {
        &self.contig
    }

    /// Appends one bucket. Ids must strictly increase across calls; an empty bucket
    /// consumes its id but writes nothing. A bucket that fails to encode or write leaves
    /// its id unused.
    pub fn put(&mut self, bucket_id: u32, bucket: &Bucket) -> Result<(), StoreError> {
        if let Some(previous) = self.last_bucket {
            if bucket_id <= previous {
                return Err(StoreError::BucketOrder {
                    contig: self.contig.to_string(),
                    previous,
                    bucket: bucket_id,
                });
            }
        }
        if bucket.is_empty() {
            self.last_bucket = Some(bucket_id);
            return Ok(());
        }

        let raw = self.encode_bucket(bucket)?;
        let mut encoder = DeflateEncoder::new(Vec::with_capacity(raw.len() / 4), self.compression);
        encoder.write_all(&raw).at(&self.path)?;
        let compressed = encoder.finish().at(&self.path)?;

        self.writer.write_all(&compressed).at(&self.path)?;
        self.last_bucket = Some(bucket_id);
        self.directory.push((
            bucket_id,
            BucketExtent {
                offset: self.offset,
                length: compressed.len() as u64,
            },
        ));
        self.offset += compressed.len() as u64;
        debug!(
            "{}: wrote bucket {bucket_id} ({} variants, {} bytes)",
            self.contig,
            bucket.len(),
            compressed.len()
        );
        Ok(())
    }

    fn encode_bucket(&self, bucket: &Bucket) -> Result<Vec<u8>, StoreError> {
        let words_per_mask = words_for(self.patient_count);
        let mut out = Vec::with_capacity(bucket.len() * (24 + words_per_mask * 8));
        out.extend_from_slice(&(bucket.len() as u32).to_le_bytes());

        for (key, record) in bucket {
            if key.contig() != &*self.contig {
                return Err(StoreError::ContigMismatch {
                    contig: self.contig.to_string(),
                    variant: key.to_string(),
                });
            }
            out.extend_from_slice(&key.position().to_le_bytes());
            push_str(&mut out, key.reference());
            push_str(&mut out, key.alternate());

            let mut presence = 0u8;
            for class in MaskClass::ALL {
                if let Some(mask) = record.get(class) {
                    if mask.len() != self.patient_count {
                        return Err(StoreError::MaskWidth {
                            variant: key.to_string(),
                            expected: self.patient_count,
                            found: mask.len(),
                        });
                    }
                    presence |= 1 << class.index();
                }
            }
            out.push(presence);
            for class in MaskClass::ALL {
                if let Some(mask) = record.get(class) {
                    for word in mask.to_words() {
                        out.extend_from_slice(&word.to_le_bytes());
                    }
                }
            }
        }
        Ok(out)
    }

    /// Writes the directory footer, syncs the file and reopens it read-only.
    pub fn seal(mut self) -> Result<ChunkedStore, StoreError> {
        let mut footer =
            Vec::with_capacity(4 + self.directory.len() * DIRECTORY_ENTRY_LEN + TRAILER_LEN);
        footer.extend_from_slice(&(self.directory.len() as u32).to_le_bytes());
        for (bucket_id, extent) in &self.directory {
            footer.extend_from_slice(&bucket_id.to_le_bytes());
            footer.extend_from_slice(&extent.offset.to_le_bytes());
            footer.extend_from_slice(&extent.length.to_le_bytes());
        }
        footer.extend_from_slice(&self.offset.to_le_bytes());
        footer.extend_from_slice(TRAILER_MAGIC);
        self.writer.write_all(&footer).at(&self.path)?;

        let file = self
            .writer
            .into_inner()
            .map_err(|e| e.into_error())
            .at(&self.path)?;
        file.sync_all().at(&self.path)?;
        drop(file);

        debug!(
            "{}: sealed with {} buckets",
            self.contig,
            self.directory.len()
        );
        ChunkedStore::open(&self.path)
    }
}

fn push_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// A sealed, memory-mapped contig store. Immutable and safe to share across threads.
pub struct ChunkedStore {
    path: PathBuf,
    contig: Arc<str>,
    patient_count: usize,
    mmap: Mmap,
    directory: BTreeMap<u32, BucketExtent>,
}

impl std::fmt::Debug for ChunkedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedStore")
            .field("path", &self.path)
            .field("contig", &self.contig)
            .field("patient_count", &self.patient_count)
            .field("buckets", &self.directory.len())
            .finish()
    }
}

impl ChunkedStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let file = File::open(path).at(path)?;
        let len = file.metadata().at(path)?.len() as usize;
        if len < HEADER_MAGIC.len() + TRAILER_LEN {
            return Err(StoreError::corrupt(path, "file is too short to hold a sealed store"));
        }
        // The file is never modified once sealed.
        let mmap = unsafe { Mmap::map(&file) }.at(path)?;

        let mut header = ByteReader::new(&mmap);
        if header.take(4) != Some(HEADER_MAGIC.as_slice()) {
            return Err(StoreError::corrupt(path, "missing header magic"));
        }
        let version = header
            .u16()
            .ok_or_else(|| StoreError::corrupt(path, "truncated header"))?;
        if version != FORMAT_VERSION {
            return Err(StoreError::corrupt(
                path,
                format!("unsupported format version {version} (expected {FORMAT_VERSION})"),
            ));
        }
        let patient_count = header
            .u64()
            .ok_or_else(|| StoreError::corrupt(path, "truncated header"))?
            as usize;
        let contig = header
            .string()
            .ok_or_else(|| StoreError::corrupt(path, "truncated contig name"))?;
        let data_start = header.position();

        if &mmap[len - TRAILER_MAGIC.len()..] != TRAILER_MAGIC {
            return Err(StoreError::corrupt(path, "missing directory footer"));
        }
        let mut trailer = ByteReader::new(&mmap[len - TRAILER_LEN..]);
        let footer_offset = trailer
            .u64()
            .ok_or_else(|| StoreError::corrupt(path, "truncated trailer"))?
            as usize;
        if footer_offset < data_start || footer_offset > len - TRAILER_LEN {
            return Err(StoreError::corrupt(path, "footer offset out of range"));
        }

        let mut footer = ByteReader::new(&mmap[footer_offset..len - TRAILER_LEN]);
        let entries = footer
            .u32()
            .ok_or_else(|| StoreError::corrupt(path, "truncated directory"))?;
        let mut directory = BTreeMap::new();
        for _ in 0..entries {
            let (bucket_id, offset, length) = match (footer.u32(), footer.u64(), footer.u64()) {
                (Some(b), Some(o), Some(l)) => (b, o, l),
                _ => return Err(StoreError::corrupt(path, "truncated directory entry")),
            };
            let within = offset >= data_start as u64
                && offset
                    .checked_add(length)
                    .is_some_and(|end| end <= footer_offset as u64);
            if !within {
                return Err(StoreError::corrupt(
                    path,
                    format!("bucket {bucket_id} lies outside the data region"),
                ));
            }
            directory.insert(bucket_id, BucketExtent { offset, length });
        }

        Ok(Self {
            path: path.to_path_buf(),
            contig: Arc::from(contig.as_str()),
            patient_count,
            mmap,
            directory,
        })
    }

    pub fn contig(&self) -> &str {
        &self.contig
    }

    pub fn patient_count(&self) -> usize {
        self.patient_count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bucket_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.directory.keys().copied()
    }

    pub fn bucket_count(&self) -> usize {
        self.directory.len()
    }

    /// Decodes one bucket. A bucket that was never written is `None`.
    pub fn get(&self, bucket_id: u32) -> Result<Option<Bucket>, StoreError> {
        let Some(extent) = self.directory.get(&bucket_id) else {
            return Ok(None);
        };
        let start = extent.offset as usize;
        let compressed = &self.mmap[start..start + extent.length as usize];
        let mut raw = Vec::with_capacity(compressed.len() * 4);
        DeflateDecoder::new(compressed)
            .read_to_end(&mut raw)
            .at(&self.path)?;
        self.decode_bucket(bucket_id, &raw).map(Some)
    }

    fn decode_bucket(&self, bucket_id: u32, raw: &[u8]) -> Result<Bucket, StoreError> {
        let truncated = || StoreError::corrupt(&self.path, format!("bucket {bucket_id} is truncated"));
        let words_per_mask = words_for(self.patient_count);
        let mut reader = ByteReader::new(raw);
        let count = reader.u32().ok_or_else(truncated)?;
        let mut bucket = Bucket::new();

        for _ in 0..count {
            let position = reader.u32().ok_or_else(truncated)?;
            let reference = reader.string().ok_or_else(truncated)?;
            let alternate = reader.string().ok_or_else(truncated)?;
            let presence = reader.u8().ok_or_else(truncated)?;

            let mut record = MaskRecord::new();
            for class in MaskClass::ALL {
                if presence & (1 << class.index()) == 0 {
                    continue;
                }
                let mut words = Vec::with_capacity(words_per_mask);
                for _ in 0..words_per_mask {
                    words.push(reader.u64().ok_or_else(truncated)?);
                }
                let mask = PatientMask::from_words(self.patient_count, words)
                    .ok_or_else(truncated)?;
                record.set(class, mask);
            }
            let key = VariantKey::new(self.contig.clone(), position, reference, alternate);
            bucket.insert(key, record);
        }
        Ok(bucket)
    }
}

struct ByteReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    fn position(&self) -> usize {
        self.position
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.position.checked_add(n)?;
        let slice = self.data.get(self.position..end)?;
        self.position = end;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2)
            .and_then(|b| b.try_into().ok())
            .map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Option<u64> {
        self.take(8)
            .and_then(|b| b.try_into().ok())
            .map(u64::from_le_bytes)
    }

    fn string(&mut self) -> Option<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).ok()
    }
}
