use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::buffer::Buffer;
use crate::cache::Cache;
use crate::cipher::Cipher;
use crate::config::Config;
use crate::encoder::{Encoder, Registry, StringSetEncoder};
use crate::entry::{data_type, Entry, ObjectValue, VarMeta, VarValue, CIPHER_MASK, DATA_START};
use crate::error::Result;
use crate::executor::TagExecutor;
use crate::hasher;
use crate::segment::{bytes_threshold, InvalidTracker, BASE_GC_KEYS_THRESHOLD};
use crate::util;
use crate::{errinput, errstate};

use super::io::Backend;
use super::Value;

/// How many recently spilled blobs and decoded large values to keep around.
const EXTERNAL_CACHE_SIZE: usize = 32;
const BIG_VALUE_CACHE_SIZE: usize = 32;

/// A decoded variable-length value on its way into the log.
pub(crate) enum VarKind {
    Str(String),
    Array(Vec<u8>),
    Object(ObjectValue, Arc<dyn Encoder>),
}

/// The log engine. All state behind the store lock lives here: the data
/// image, the index of live entries, the tombstone ledger and the caches.
pub(crate) struct Engine {
    pub(crate) path: PathBuf,
    pub(crate) name: String,
    pub(crate) cipher: Option<Arc<dyn Cipher>>,
    pub(crate) registry: Registry,
    pub(crate) config: Config,
    pub(crate) internal_limit: usize,

    pub(crate) buffer: Buffer,
    pub(crate) data_end: usize,
    pub(crate) checksum: u64,
    pub(crate) data: HashMap<String, Entry>,
    pub(crate) invalids: InvalidTracker,
    pub(crate) need_rewrite: bool,

    pub(crate) external_cache: Cache<String, Arc<Vec<u8>>>,
    pub(crate) big_value_cache: Cache<String, Value>,
    pub(crate) executor: Arc<TagExecutor>,
    pub(crate) backend: Backend,
    /// Sidecar writes block with an fsync instead of going through the
    /// executor. Set in sync-blocking mode and during the encryption rewrite.
    pub(crate) blocking_external: bool,

    update_start: usize,
    update_size: usize,
    dirty: Option<(usize, usize)>,
    temp_external: Option<String>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        path: PathBuf,
        name: String,
        registry: Registry,
        cipher: Option<Arc<dyn Cipher>>,
        config: Config,
        executor: Arc<TagExecutor>,
        backend: Backend,
        blocking_external: bool,
    ) -> Self {
        let internal_limit = config.clamped_internal_limit();
        let mut engine = Engine {
            path,
            name,
            cipher,
            registry,
            config,
            internal_limit,
            buffer: Buffer::new(util::page_size()),
            data_end: DATA_START,
            checksum: 0,
            data: HashMap::new(),
            invalids: InvalidTracker::new(),
            need_rewrite: false,
            external_cache: Cache::new(EXTERNAL_CACHE_SIZE),
            big_value_cache: Cache::new(BIG_VALUE_CACHE_SIZE),
            executor,
            backend,
            blocking_external,
            update_start: 0,
            update_size: 0,
            dirty: None,
            temp_external: None,
        };
        engine.write_header();
        engine
    }

    /// Directory holding this store's sidecar files.
    pub(crate) fn external_dir(&self) -> PathBuf {
        self.path.join(&self.name)
    }

    pub(crate) fn reset_memory(&mut self) {
        self.data_end = DATA_START;
        self.checksum = 0;
        self.data.clear();
        self.big_value_cache.clear();
        self.external_cache.clear();
        self.invalids.clear();
        self.dirty = None;
        if self.buffer.capacity() != util::page_size() {
            self.buffer = Buffer::new(util::page_size());
        } else {
            self.buffer.hb.fill(0);
        }
        self.write_header();
    }

    fn check_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return errinput!("key is empty");
        }
        Ok(())
    }

    fn check_key_size(key_size: usize) -> Result<()> {
        if key_size > 0xFF {
            return errinput!("key's length must be less than 256");
        }
        Ok(())
    }

    fn packed_size(&self) -> u32 {
        let size = (self.data_end - DATA_START) as u32;
        match self.cipher {
            Some(_) => size | CIPHER_MASK,
            None => size,
        }
    }

    fn write_header(&mut self) {
        let packed = self.packed_size();
        self.buffer.put_u32_at(0, packed);
        self.buffer.put_u64_at(4, self.checksum);
    }

    fn mark_dirty(&mut self, start: usize, end: usize) {
        self.dirty = Some(match self.dirty {
            Some((s, e)) => (s.min(start), e.max(end)),
            None => (start, end),
        });
    }

    /// Writes the header and pushes the accumulated dirty range down to the
    /// backing file(s).
    fn flush_change(&mut self) -> Result<()> {
        self.write_header();
        if let Some((start, end)) = self.dirty.take() {
            self.backend.commit(&self.buffer.hb, start, end)?;
        }
        Ok(())
    }

    fn ensure_size(&mut self, allocate: usize) -> Result<()> {
        let required = self.data_end + allocate;
        if required <= self.buffer.capacity() {
            return Ok(());
        }
        let capacity = util::new_capacity(self.buffer.capacity(), required)?;
        self.buffer.hb.resize(capacity, 0);
        self.backend.ensure_capacity(capacity)
    }

    fn prepare_put_bytes(&mut self) -> Result<()> {
        self.ensure_size(self.update_size)?;
        self.update_start = self.data_end;
        self.data_end += self.update_size;
        self.buffer.position = self.update_start;
        Ok(())
    }

    fn prepare_header_info(&mut self, key_size: usize, value_size: usize, info: u8) -> Result<()> {
        Self::check_key_size(key_size)?;
        self.update_size = 2 + key_size + value_size;
        self.prepare_put_bytes()?;
        self.buffer.put_u8(info);
        Ok(())
    }

    fn wrap_header(&mut self, key: &str, info: u8, value_size: usize) -> Result<()> {
        match self.cipher.clone() {
            Some(cipher) => {
                let key_bytes = cipher.encrypt(key.as_bytes())?;
                self.prepare_header_info(key_bytes.len(), value_size, info)?;
                self.buffer.put_u8(key_bytes.len() as u8);
                self.buffer.put_bytes(&key_bytes);
            }
            None => {
                self.prepare_header_info(key.len(), value_size, info)?;
                self.buffer.put_u8(key.len() as u8);
                self.buffer.put_bytes(key.as_bytes());
            }
        }
        Ok(())
    }

    /// Folds the freshly appended record into the checksum and flushes. The
    /// appended bytes were outside `[DATA_START, data_end)` until now, so a
    /// single fold adds exactly their contribution.
    fn finish_append(&mut self) -> Result<()> {
        self.checksum ^= self.buffer.checksum(self.update_start, self.update_size);
        self.mark_dirty(self.update_start, self.update_start + self.update_size);
        self.flush_change()
    }

    fn update_u8_in_place(&mut self, offset: usize, value: u8) {
        let old = self.buffer.hb[offset];
        self.checksum ^= hasher::shift((value ^ old) as u64, offset);
        self.buffer.hb[offset] = value;
        self.mark_dirty(offset, offset + 1);
    }

    fn update_i32_in_place(&mut self, offset: usize, value: i32) {
        let old = self.buffer.get_i32_at(offset);
        let sum = ((value ^ old) as u32) as u64;
        self.checksum ^= hasher::shift(sum, offset);
        self.buffer.put_i32_at(offset, value);
        self.mark_dirty(offset, offset + 4);
    }

    fn update_i64_in_place(&mut self, offset: usize, value: i64) {
        let old = self.buffer.get_i64_at(offset);
        let sum = (value ^ old) as u64;
        self.checksum ^= hasher::shift(sum, offset);
        self.buffer.put_i64_at(offset, value);
        self.mark_dirty(offset, offset + 8);
    }

    fn update_bytes_in_place(&mut self, offset: usize, bytes: &[u8]) {
        self.checksum ^= self.buffer.checksum(offset, bytes.len());
        self.buffer.position = offset;
        self.buffer.put_bytes(bytes);
        self.checksum ^= self.buffer.checksum(offset, bytes.len());
        self.mark_dirty(offset, offset + bytes.len());
    }

    /// Flips a record's info byte to a tombstone and books the dead range.
    fn tombstone(&mut self, type_tag: u8, start: usize, end: usize) {
        self.invalids.count(start, end);
        self.update_u8_in_place(start, type_tag | data_type::DELETE_MASK);
    }

    fn encrypted_key_size(&self, key: &str) -> Result<usize> {
        match &self.cipher {
            Some(cipher) => Ok(cipher.encrypt(key.as_bytes())?.len()),
            None => Ok(key.len()),
        }
    }

    // ---- fixed-width puts ----

    pub(crate) fn put_bool(&mut self, key: &str, value: bool) -> Result<()> {
        Self::check_key(key)?;
        let existing = match self.data.get(key) {
            None => None,
            Some(Entry::Bool { offset, value }) => Some((*offset, *value)),
            Some(_) => return errinput!("key {key:?} holds a different type"),
        };
        match existing {
            None => {
                self.wrap_header(key, data_type::BOOLEAN, 1)?;
                let offset = self.buffer.position;
                self.buffer.put_u8(value as u8);
                self.finish_append()?;
                self.data.insert(key.to_string(), Entry::Bool { offset, value });
            }
            Some((_, old)) if old == value => {}
            Some((offset, _)) => {
                self.update_u8_in_place(offset, value as u8);
                self.data.insert(key.to_string(), Entry::Bool { offset, value });
                self.flush_change()?;
            }
        }
        Ok(())
    }

    pub(crate) fn put_int(&mut self, key: &str, value: i32) -> Result<()> {
        Self::check_key(key)?;
        let existing = match self.data.get(key) {
            None => None,
            Some(Entry::Int { offset, value }) => Some((*offset, *value)),
            Some(_) => return errinput!("key {key:?} holds a different type"),
        };
        let raw = match &self.cipher {
            Some(cipher) => cipher.encrypt_i32(value),
            None => value,
        };
        match existing {
            None => {
                self.wrap_header(key, data_type::INT, 4)?;
                let offset = self.buffer.position;
                self.buffer.put_i32(raw);
                self.finish_append()?;
                self.data.insert(key.to_string(), Entry::Int { offset, value });
            }
            Some((_, old)) if old == value => {}
            Some((offset, _)) => {
                self.update_i32_in_place(offset, raw);
                self.data.insert(key.to_string(), Entry::Int { offset, value });
                self.flush_change()?;
            }
        }
        Ok(())
    }

    pub(crate) fn put_float(&mut self, key: &str, value: f32) -> Result<()> {
        Self::check_key(key)?;
        let existing = match self.data.get(key) {
            None => None,
            Some(Entry::Float { offset, value }) => Some((*offset, *value)),
            Some(_) => return errinput!("key {key:?} holds a different type"),
        };
        let raw = value.to_bits() as i32;
        let raw = match &self.cipher {
            Some(cipher) => cipher.encrypt_i32(raw),
            None => raw,
        };
        match existing {
            None => {
                self.wrap_header(key, data_type::FLOAT, 4)?;
                let offset = self.buffer.position;
                self.buffer.put_i32(raw);
                self.finish_append()?;
                self.data.insert(key.to_string(), Entry::Float { offset, value });
            }
            Some((_, old)) if old.to_bits() == value.to_bits() => {}
            Some((offset, _)) => {
                self.update_i32_in_place(offset, raw);
                self.data.insert(key.to_string(), Entry::Float { offset, value });
                self.flush_change()?;
            }
        }
        Ok(())
    }

    pub(crate) fn put_long(&mut self, key: &str, value: i64) -> Result<()> {
        Self::check_key(key)?;
        let existing = match self.data.get(key) {
            None => None,
            Some(Entry::Long { offset, value }) => Some((*offset, *value)),
            Some(_) => return errinput!("key {key:?} holds a different type"),
        };
        let raw = match &self.cipher {
            Some(cipher) => cipher.encrypt_i64(value),
            None => value,
        };
        match existing {
            None => {
                self.wrap_header(key, data_type::LONG, 8)?;
                let offset = self.buffer.position;
                self.buffer.put_i64(raw);
                self.finish_append()?;
                self.data.insert(key.to_string(), Entry::Long { offset, value });
            }
            Some((_, old)) if old == value => {}
            Some((offset, _)) => {
                self.update_i64_in_place(offset, raw);
                self.data.insert(key.to_string(), Entry::Long { offset, value });
                self.flush_change()?;
            }
        }
        Ok(())
    }

    pub(crate) fn put_double(&mut self, key: &str, value: f64) -> Result<()> {
        Self::check_key(key)?;
        let existing = match self.data.get(key) {
            None => None,
            Some(Entry::Double { offset, value }) => Some((*offset, *value)),
            Some(_) => return errinput!("key {key:?} holds a different type"),
        };
        let raw = value.to_bits() as i64;
        let raw = match &self.cipher {
            Some(cipher) => cipher.encrypt_i64(raw),
            None => raw,
        };
        match existing {
            None => {
                self.wrap_header(key, data_type::DOUBLE, 8)?;
                let offset = self.buffer.position;
                self.buffer.put_i64(raw);
                self.finish_append()?;
                self.data.insert(key.to_string(), Entry::Double { offset, value });
            }
            Some((_, old)) if old.to_bits() == value.to_bits() => {}
            Some((offset, _)) => {
                self.update_i64_in_place(offset, raw);
                self.data.insert(key.to_string(), Entry::Double { offset, value });
                self.flush_change()?;
            }
        }
        Ok(())
    }

    // ---- variable-length puts ----

    pub(crate) fn put_string(&mut self, key: &str, value: &str) -> Result<()> {
        Self::check_key(key)?;
        if self.cipher.is_none() && value.len() < self.internal_limit {
            // putString is hot, so small unencrypted strings skip the
            // intermediate allocation and write straight into the image.
            self.fast_put_string(key, value)
        } else {
            let bytes = match &self.cipher {
                Some(cipher) => cipher.encrypt(value.as_bytes())?,
                None => value.as_bytes().to_vec(),
            };
            self.add_or_update(key, VarKind::Str(value.to_string()), bytes, data_type::STRING)
        }
    }

    fn fast_put_string(&mut self, key: &str, value: &str) -> Result<()> {
        let existing = match self.data.get(key) {
            None => None,
            Some(Entry::Str { meta, value }) => Some((*meta, value.file_name().map(String::from))),
            Some(_) => return errinput!("key {key:?} holds a different type"),
        };
        let value_len = value.len();
        match existing {
            None => {
                Self::check_key_size(key.len())?;
                // type:1, keySize:1, key, valueSize:2
                let pre = 4 + key.len();
                self.update_size = pre + value_len;
                self.prepare_put_bytes()?;
                self.buffer.put_u8(data_type::STRING);
                self.buffer.put_u8(key.len() as u8);
                self.buffer.put_bytes(key.as_bytes());
                self.buffer.put_u16(value_len as u16);
                self.buffer.put_bytes(value.as_bytes());
                let meta = VarMeta {
                    start: self.update_start,
                    offset: self.update_start + pre,
                    value_size: value_len,
                    external: false,
                };
                self.finish_append()?;
                self.data.insert(
                    key.to_string(),
                    Entry::Str { meta, value: VarValue::Inline(value.to_string()) },
                );
                Ok(())
            }
            Some((meta, _)) if !meta.external && meta.value_size == value_len => {
                self.update_bytes_in_place(meta.offset, value.as_bytes());
                self.data.insert(
                    key.to_string(),
                    Entry::Str { meta, value: VarValue::Inline(value.to_string()) },
                );
                self.flush_change()
            }
            Some((meta, old_file)) => {
                let pre = meta.offset - meta.start;
                self.update_size = pre + value_len;
                self.prepare_put_bytes()?;
                self.buffer.put_u8(data_type::STRING);
                // The old record already holds the encoded keySize and key.
                let key_span = pre - 3;
                let from = meta.start + 1;
                let to = self.buffer.position;
                self.buffer.hb.copy_within(from..from + key_span, to);
                self.buffer.position += key_span;
                self.buffer.put_u16(value_len as u16);
                self.buffer.put_bytes(value.as_bytes());

                self.tombstone(data_type::STRING, meta.start, meta.offset + meta.value_size);
                let new_meta = VarMeta {
                    start: self.update_start,
                    offset: self.update_start + pre,
                    value_size: value_len,
                    external: false,
                };
                self.finish_append()?;
                self.data.insert(
                    key.to_string(),
                    Entry::Str { meta: new_meta, value: VarValue::Inline(value.to_string()) },
                );
                self.check_gc()?;
                if let Some(file) = old_file {
                    self.remove_old_file(key, file);
                }
                Ok(())
            }
        }
    }

    pub(crate) fn put_array(&mut self, key: &str, value: &[u8]) -> Result<()> {
        Self::check_key(key)?;
        let bytes = match &self.cipher {
            Some(cipher) => cipher.encrypt(value)?,
            None => value.to_vec(),
        };
        self.add_or_update(key, VarKind::Array(value.to_vec()), bytes, data_type::ARRAY)
    }

    pub(crate) fn put_object(
        &mut self,
        key: &str,
        value: ObjectValue,
        encoder: Arc<dyn Encoder>,
    ) -> Result<()> {
        Self::check_key(key)?;
        let tag = encoder.tag().to_string();
        self.registry.check_tag(&tag)?;

        let obj_bytes = match encoder.encode(value.as_ref()) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(name = %self.name, key, error = %e, "object encode failed");
                return self.remove(key);
            }
        };

        // {tagSize, tag, encoded object} as one payload; encrypted whole.
        let mut bytes = Vec::with_capacity(1 + tag.len() + obj_bytes.len());
        bytes.push(tag.len() as u8);
        bytes.extend_from_slice(tag.as_bytes());
        bytes.extend_from_slice(&obj_bytes);
        let bytes = match &self.cipher {
            Some(cipher) => cipher.encrypt(&bytes)?,
            None => bytes,
        };
        self.add_or_update(key, VarKind::Object(value, encoder), bytes, data_type::OBJECT)
    }

    pub(crate) fn put_string_set(
        &mut self,
        key: &str,
        value: std::collections::HashSet<String>,
    ) -> Result<()> {
        let Some(encoder) = self.registry.get(StringSetEncoder::TAG) else {
            return errstate!("string set encoder missing");
        };
        self.put_object(key, Arc::new(value), encoder)
    }

    fn add_or_update(
        &mut self,
        key: &str,
        value: VarKind,
        bytes: Vec<u8>,
        type_tag: u8,
    ) -> Result<()> {
        let existing = match self.data.get(key) {
            None => None,
            Some(entry) => match entry.var_meta() {
                Some(meta) if entry.type_tag() == type_tag => {
                    Some((*meta, entry.external_file().map(String::from)))
                }
                _ => return errinput!("key {key:?} holds a different type"),
            },
        };
        match existing {
            None => {
                let offset = self.save_array(key, &bytes, type_tag)?;
                let external = self.temp_external.take();
                let meta = VarMeta {
                    start: self.update_start,
                    offset,
                    value_size: external.as_ref().map_or(bytes.len(), |_| util::NAME_SIZE),
                    external: external.is_some(),
                };
                self.finish_append()?;
                let entry = self.build_var_entry(key, meta, value, external);
                self.data.insert(key.to_string(), entry);
                Ok(())
            }
            Some((meta, _)) if !meta.external && meta.value_size == bytes.len() => {
                self.update_bytes_in_place(meta.offset, &bytes);
                let entry = self.build_var_entry(key, meta, value, None);
                self.data.insert(key.to_string(), entry);
                self.flush_change()
            }
            Some((meta, old_file)) => {
                let offset = self.save_array(key, &bytes, type_tag)?;
                let external = self.temp_external.take();
                self.tombstone(type_tag, meta.start, meta.offset + meta.value_size);
                let new_meta = VarMeta {
                    start: self.update_start,
                    offset,
                    value_size: external.as_ref().map_or(bytes.len(), |_| util::NAME_SIZE),
                    external: external.is_some(),
                };
                self.finish_append()?;
                let entry = self.build_var_entry(key, new_meta, value, external);
                self.data.insert(key.to_string(), entry);
                self.check_gc()?;
                if let Some(file) = old_file {
                    self.remove_old_file(key, file);
                }
                Ok(())
            }
        }
    }

    fn build_var_entry(
        &mut self,
        key: &str,
        meta: VarMeta,
        value: VarKind,
        external: Option<String>,
    ) -> Entry {
        match (value, external) {
            (VarKind::Str(s), None) => Entry::Str { meta, value: VarValue::Inline(s) },
            (VarKind::Str(s), Some(file)) => {
                self.big_value_cache.insert(key.to_string(), Value::Str(s));
                Entry::Str { meta, value: VarValue::External(file) }
            }
            (VarKind::Array(a), None) => Entry::Array { meta, value: VarValue::Inline(a) },
            (VarKind::Array(a), Some(file)) => {
                self.big_value_cache.insert(key.to_string(), Value::Array(a));
                Entry::Array { meta, value: VarValue::External(file) }
            }
            (VarKind::Object(o, encoder), None) => Entry::Object {
                meta,
                value: VarValue::Inline(o),
                encoder: Some(encoder),
            },
            (VarKind::Object(o, encoder), Some(file)) => {
                self.big_value_cache.insert(
                    key.to_string(),
                    Value::Object { tag: encoder.tag().to_string(), value: o },
                );
                Entry::Object {
                    meta,
                    value: VarValue::External(file),
                    encoder: Some(encoder),
                }
            }
        }
    }

    /// Writes the value inline, or spills it to a sidecar file and writes
    /// the file name in its place. Returns the value payload offset.
    fn save_array(&mut self, key: &str, bytes: &[u8], type_tag: u8) -> Result<usize> {
        self.temp_external = None;
        if bytes.len() < self.internal_limit {
            return self.wrap_array(key, bytes, type_tag);
        }

        tracing::info!(name = %self.name, key, size = bytes.len(), "large value");
        let file_name = util::random_name();
        let blob = Arc::new(bytes.to_vec());
        self.external_cache.insert(file_name.clone(), Arc::clone(&blob));

        let path = self.external_dir().join(&file_name);
        if self.blocking_external {
            if let Err(e) = util::save_bytes(&path, &blob) {
                tracing::warn!(name = %self.name, key, error = %e, "large value write failed");
            }
        } else {
            let key_owned = key.to_string();
            self.executor.execute(key, move || {
                let start = Instant::now();
                match util::save_bytes(&path, &blob) {
                    Ok(()) => tracing::info!(
                        key = %key_owned,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "large value written"
                    ),
                    Err(e) => {
                        tracing::warn!(key = %key_owned, error = %e, "large value write failed")
                    }
                }
            });
        }

        self.temp_external = Some(file_name.clone());
        self.wrap_array(key, file_name.as_bytes(), type_tag | data_type::EXTERNAL_MASK)
    }

    fn wrap_array(&mut self, key: &str, value: &[u8], info: u8) -> Result<usize> {
        self.wrap_header(key, info, 2 + value.len())?;
        self.buffer.put_u16(value.len() as u16);
        let offset = self.buffer.position;
        self.buffer.put_bytes(value);
        Ok(offset)
    }

    /// Schedules the previous sidecar for deletion. Keyed by the user key so
    /// it lands after any still-pending write of that same file.
    fn remove_old_file(&mut self, key: &str, file_name: String) {
        self.external_cache.remove(&file_name);
        let path = self.external_dir().join(&file_name);
        if self.blocking_external {
            if let Err(e) = util::delete_file(&path) {
                tracing::warn!(name = %self.name, error = %e, "sidecar delete failed");
            }
        } else {
            self.executor.execute(key, move || {
                if let Err(e) = util::delete_file(&path) {
                    tracing::warn!(error = %e, "sidecar delete failed");
                }
            });
        }
    }

    // ---- remove / clear ----

    pub(crate) fn remove(&mut self, key: &str) -> Result<()> {
        Self::check_key(key)?;
        let located = match self.data.get(key) {
            None => return Ok(()),
            Some(entry) => {
                let type_tag = entry.type_tag();
                match entry.var_meta() {
                    Some(meta) => (
                        type_tag,
                        meta.start,
                        meta.offset + meta.value_size,
                        entry.external_file().map(String::from),
                    ),
                    None => {
                        let key_size = self.encrypted_key_size(key)?;
                        let offset = entry.offset();
                        let value_size = data_type::TYPE_SIZE[type_tag as usize];
                        (type_tag, offset - 2 - key_size, offset + value_size, None)
                    }
                }
            }
        };
        let (type_tag, start, end, old_file) = located;
        self.data.remove(key);
        self.big_value_cache.remove(&key.to_string());
        self.tombstone(type_tag, start, end);
        self.flush_change()?;
        self.check_gc()?;
        if let Some(file) = old_file {
            self.remove_old_file(key, file);
        }
        Ok(())
    }

    pub(crate) fn clear(&mut self) -> Result<()> {
        self.reset_memory();
        self.backend.replace_all(&self.buffer.hb)?;
        self.executor.wait_idle();
        util::delete_dir(&self.external_dir())?;
        Ok(())
    }

    // ---- reads ----

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub(crate) fn get_bool(&self, key: &str) -> Option<bool> {
        match self.data.get(key) {
            Some(Entry::Bool { value, .. }) => Some(*value),
            _ => None,
        }
    }

    pub(crate) fn get_int(&self, key: &str) -> Option<i32> {
        match self.data.get(key) {
            Some(Entry::Int { value, .. }) => Some(*value),
            _ => None,
        }
    }

    pub(crate) fn get_float(&self, key: &str) -> Option<f32> {
        match self.data.get(key) {
            Some(Entry::Float { value, .. }) => Some(*value),
            _ => None,
        }
    }

    pub(crate) fn get_long(&self, key: &str) -> Option<i64> {
        match self.data.get(key) {
            Some(Entry::Long { value, .. }) => Some(*value),
            _ => None,
        }
    }

    pub(crate) fn get_double(&self, key: &str) -> Option<f64> {
        match self.data.get(key) {
            Some(Entry::Double { value, .. }) => Some(*value),
            _ => None,
        }
    }

    pub(crate) fn get_string(&mut self, key: &str) -> Option<String> {
        let file = match self.data.get(key) {
            Some(Entry::Str { value, .. }) => match value {
                VarValue::Inline(s) => return Some(s.clone()),
                VarValue::External(file) => file.clone(),
            },
            _ => return None,
        };
        if let Some(Value::Str(s)) = self.big_value_cache.get(&key.to_string()) {
            return Some(s.clone());
        }
        let decoded = self
            .external_bytes(&file, true)
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .filter(|s| !s.is_empty());
        match decoded {
            Some(s) => {
                self.big_value_cache.insert(key.to_string(), Value::Str(s.clone()));
                Some(s)
            }
            None => {
                let _ = self.remove(key);
                None
            }
        }
    }

    pub(crate) fn get_array(&mut self, key: &str) -> Option<Vec<u8>> {
        let file = match self.data.get(key) {
            Some(Entry::Array { value, .. }) => match value {
                VarValue::Inline(a) => return Some(a.clone()),
                VarValue::External(file) => file.clone(),
            },
            _ => return None,
        };
        if let Some(Value::Array(a)) = self.big_value_cache.get(&key.to_string()) {
            return Some(a.clone());
        }
        let bytes = self.external_bytes(&file, true).filter(|b| !b.is_empty());
        match bytes {
            Some(bytes) => {
                self.big_value_cache
                    .insert(key.to_string(), Value::Array(bytes.clone()));
                Some(bytes)
            }
            None => {
                let _ = self.remove(key);
                None
            }
        }
    }

    /// Resolves an OBJECT entry to its decoded value and tag.
    pub(crate) fn get_object(&mut self, key: &str) -> Option<(String, ObjectValue)> {
        let (file, known_encoder) = match self.data.get(key) {
            Some(Entry::Object { value, encoder, .. }) => match value {
                VarValue::Inline(obj) => {
                    let encoder = encoder.as_ref()?;
                    return Some((encoder.tag().to_string(), obj.clone()));
                }
                VarValue::External(file) => (file.clone(), encoder.clone()),
            },
            _ => return None,
        };
        if let Some(Value::Object { tag, value }) = self.big_value_cache.get(&key.to_string()) {
            return Some((tag.clone(), value.clone()));
        }
        match self.decode_external_object(&file) {
            Some((tag, obj, encoder)) => {
                if known_encoder.is_none() {
                    if let Some(Entry::Object { encoder: slot, .. }) = self.data.get_mut(key) {
                        *slot = Some(encoder);
                    }
                }
                self.big_value_cache.insert(
                    key.to_string(),
                    Value::Object { tag: tag.clone(), value: obj.clone() },
                );
                Some((tag, obj))
            }
            None => {
                let _ = self.remove(key);
                None
            }
        }
    }

    pub(crate) fn get_string_set(&mut self, key: &str) -> Option<std::collections::HashSet<String>> {
        let (_, obj) = self.get_object(key)?;
        obj.downcast_ref::<std::collections::HashSet<String>>().cloned()
    }

    /// Raw sidecar bytes: the write-through cache first, then the file.
    pub(super) fn external_bytes(&mut self, file_name: &str, decrypt: bool) -> Option<Vec<u8>> {
        let raw = match self.external_cache.get(&file_name.to_string()) {
            Some(blob) => Some(blob.as_ref().clone()),
            None => {
                let path = self.external_dir().join(file_name);
                match util::read_bytes(&path) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(name = %self.name, file = file_name, error = %e, "sidecar read failed");
                        None
                    }
                }
            }
        }?;
        if decrypt {
            if let Some(cipher) = &self.cipher {
                return match cipher.decrypt(&raw) {
                    Ok(plain) => Some(plain),
                    Err(e) => {
                        tracing::error!(name = %self.name, file = file_name, error = %e, "sidecar decrypt failed");
                        None
                    }
                };
            }
        }
        Some(raw)
    }

    /// Reads and decodes an external OBJECT payload, `{tagSize, tag, bytes}`.
    fn decode_external_object(&mut self, file_name: &str) -> Option<(String, ObjectValue, Arc<dyn Encoder>)> {
        let bytes = self.external_bytes(file_name, true)?;
        if bytes.is_empty() {
            return None;
        }
        let tag_size = bytes[0] as usize;
        if bytes.len() < 1 + tag_size {
            tracing::error!(name = %self.name, file = file_name, "truncated object payload");
            return None;
        }
        let tag = String::from_utf8(bytes[1..1 + tag_size].to_vec()).ok()?;
        let Some(encoder) = self.registry.get(&tag) else {
            tracing::warn!(name = %self.name, tag = %tag, "no encoder for tag");
            return None;
        };
        match encoder.decode(&bytes[1 + tag_size..]) {
            Ok(obj) => Some((tag, Arc::from(obj), encoder)),
            Err(e) => {
                tracing::error!(name = %self.name, tag = %tag, error = %e, "object decode failed");
                None
            }
        }
    }

    pub(crate) fn get_all(&mut self) -> HashMap<String, Value> {
        let keys: Vec<String> = self.data.keys().cloned().collect();
        let mut result = HashMap::with_capacity(keys.len());
        for key in keys {
            let Some(type_tag) = self.data.get(&key).map(|entry| entry.type_tag()) else {
                continue;
            };
            let value = match type_tag {
                data_type::BOOLEAN => self.get_bool(&key).map(Value::Bool),
                data_type::INT => self.get_int(&key).map(Value::Int),
                data_type::FLOAT => self.get_float(&key).map(Value::Float),
                data_type::LONG => self.get_long(&key).map(Value::Long),
                data_type::DOUBLE => self.get_double(&key).map(Value::Double),
                data_type::STRING => self.get_string(&key).map(Value::Str),
                data_type::ARRAY => self.get_array(&key).map(Value::Array),
                _ => self.get_object(&key).map(|(tag, value)| {
                    // Surface the built-in set codec as its concrete type.
                    if tag == StringSetEncoder::TAG {
                        if let Some(set) =
                            value.downcast_ref::<std::collections::HashSet<String>>()
                        {
                            return Value::StringSet(set.clone());
                        }
                    }
                    Value::Object { tag, value }
                }),
            };
            if let Some(value) = value {
                result.insert(key, value);
            }
        }
        result
    }

    pub(crate) fn put_all(&mut self, values: HashMap<String, Value>) -> Result<()> {
        for (key, value) in values {
            if key.is_empty() {
                continue;
            }
            match value {
                Value::Bool(v) => self.put_bool(&key, v)?,
                Value::Int(v) => self.put_int(&key, v)?,
                Value::Float(v) => self.put_float(&key, v)?,
                Value::Long(v) => self.put_long(&key, v)?,
                Value::Double(v) => self.put_double(&key, v)?,
                Value::Str(v) => self.put_string(&key, &v)?,
                Value::Array(v) => self.put_array(&key, &v)?,
                Value::StringSet(v) => self.put_string_set(&key, v)?,
                Value::Object { tag, value } => match self.registry.get(&tag) {
                    Some(encoder) => self.put_object(&key, value, encoder)?,
                    None => {
                        tracing::warn!(name = %self.name, tag = %tag, "missing encoder for tag");
                    }
                },
            }
        }
        Ok(())
    }

    pub(crate) fn sync(&mut self) -> Result<()> {
        self.backend.sync()
    }

    // ---- garbage collection ----

    fn check_gc(&mut self) -> Result<()> {
        if self.invalids.len() >= BASE_GC_KEYS_THRESHOLD
            || self.invalids.bytes() >= bytes_threshold(self.data_end)
        {
            self.gc()?;
        }
        Ok(())
    }

    /// Compacts tombstoned ranges out of the payload, relocating every
    /// surviving record and splicing the checksum instead of rescanning.
    pub(crate) fn gc(&mut self) -> Result<()> {
        if self.invalids.is_empty() {
            return Ok(());
        }
        let segments = self.invalids.merge().to_vec();
        let old_data_end = self.data_end;
        let gc_start = segments[0].start;

        // Drop the dead ranges' contribution before anything moves over them.
        for seg in &segments {
            self.checksum ^= self.buffer.checksum(seg.start, seg.len());
        }

        // Relocation table: the source offset of each surviving run and the
        // cumulative shift it moves left by.
        let mut table: Vec<(usize, usize)> = Vec::with_capacity(segments.len());
        let mut shift = 0;
        for seg in &segments {
            shift += seg.len();
            table.push((seg.end, shift));
        }
        let total = shift;

        for (i, &(src, shift)) in table.iter().enumerate() {
            let end = if i + 1 < segments.len() {
                segments[i + 1].start
            } else {
                old_data_end
            };
            if src >= end {
                continue;
            }
            let len = end - src;
            let sum = self.buffer.checksum(src, len);
            self.buffer.hb.copy_within(src..end, src - shift);
            // The run moved left by `shift`, so its lanes rotate accordingly.
            self.checksum ^= sum ^ hasher::shift(sum, 8 - (shift & 7));
        }

        for entry in self.data.values_mut() {
            if entry.offset() > gc_start {
                let idx = table.partition_point(|&(src, _)| src <= entry.offset()) - 1;
                entry.relocate(table[idx].1);
            }
        }

        self.data_end = old_data_end - total;
        self.invalids.clear();
        self.mark_dirty(gc_start, old_data_end);
        self.flush_change()?;
        tracing::info!(name = %self.name, freed = total, "gc finish");

        self.truncate_if_needed()
    }

    fn truncate_if_needed(&mut self) -> Result<()> {
        let capacity = self.buffer.capacity();
        if capacity - self.data_end < util::truncate_threshold() {
            return Ok(());
        }
        let new_capacity = util::new_capacity(util::page_size(), self.data_end)?;
        if new_capacity >= capacity {
            return Ok(());
        }
        self.buffer.hb.truncate(new_capacity);
        self.write_header();
        self.backend.replace_all(&self.buffer.hb)?;
        tracing::info!(name = %self.name, capacity = new_capacity, "truncate finish");
        Ok(())
    }
}
