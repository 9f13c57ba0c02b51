use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::config::Mode;
use crate::entry::{data_type, Entry, VarMeta, VarValue, CIPHER_MASK, DATA_START};
use crate::errdata;
use crate::error::Result;
use crate::util;

use super::engine::Engine;
use super::io::{Backend, BlockingBackend, MmapBackend};

pub(crate) const A_SUFFIX: &str = ".kva";
pub(crate) const B_SUFFIX: &str = ".kvb";
pub(crate) const C_SUFFIX: &str = ".kvc";
pub(crate) const TEMP_SUFFIX: &str = ".tmp";
/// Prefix of the scratch store used while rewriting an unencrypted image.
pub(crate) const TEMP_PREFIX: &str = "temp_";

impl Engine {
    pub(crate) fn file_path(&self, suffix: &str) -> PathBuf {
        self.path.join(format!("{}{}", self.name, suffix))
    }

    /// Chooses and validates an on-disk image, builds the durability backend
    /// for the configured mode, and repairs stale sibling files. Runs the
    /// one-time encryption rewrite if the image predates the cipher.
    pub(crate) fn load(&mut self) -> Result<()> {
        fs::create_dir_all(&self.path)?;
        self.clean_temp_workspace();

        match self.config.mode {
            Mode::NonSync | Mode::DualFile => {
                self.delete_c_files();
                let a = self.file_path(A_SUFFIX);
                let b = self.file_path(B_SUFFIX);
                if !self.try_load(&a) && self.config.mode == Mode::DualFile {
                    self.try_load(&b);
                }
                let paths = match self.config.mode {
                    Mode::NonSync => vec![a],
                    _ => vec![a, b],
                };
                let capacity = self.buffer.capacity();
                self.backend = Backend::Mmap(MmapBackend::open(&paths, capacity)?);
            }
            Mode::SyncBlocking => {
                let c = self.file_path(C_SUFFIX);
                let tmp = self.file_path(TEMP_SUFFIX);
                if !self.try_load(&c) {
                    self.try_load(&tmp);
                }
                self.backend = Backend::Blocking(BlockingBackend::open(&c, &tmp)?);
            }
        }

        // Normalize both the chosen image and any stale sibling to the
        // recovered state.
        self.backend.replace_all(&self.buffer.hb)?;

        if self.need_rewrite {
            super::rewrite::rewrite(self)?;
        }
        Ok(())
    }

    fn delete_c_files(&self) {
        for suffix in [C_SUFFIX, TEMP_SUFFIX] {
            if let Err(e) = util::delete_file(&self.file_path(suffix)) {
                tracing::warn!(name = %self.name, error = %e, "stale image delete failed");
            }
        }
    }

    fn clean_temp_workspace(&self) {
        let temp_name = format!("{}{}", TEMP_PREFIX, self.name);
        let _ = util::delete_dir(&self.path.join(&temp_name));
        for suffix in [A_SUFFIX, B_SUFFIX, C_SUFFIX, TEMP_SUFFIX] {
            let _ = util::delete_file(&self.path.join(format!("{temp_name}{suffix}")));
        }
    }

    /// Attempts one candidate file, resetting memory on rejection so the
    /// caller can fall back to the sibling or start empty.
    fn try_load(&mut self, path: &Path) -> bool {
        if !path.exists() {
            return false;
        }
        match self.load_image(path) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(name = %self.name, file = ?path.file_name(), error = %e, "parse data failed");
                self.reset_memory();
                false
            }
        }
    }

    /// Reads one candidate file and reconstructs the index from it. Any
    /// validation failure leaves the image rejected; the caller falls back.
    fn load_image(&mut self, path: &Path) -> Result<()> {
        let file_len = fs::metadata(path)?.len() as usize;
        if file_len < DATA_START || file_len >= util::DATA_SIZE_LIMIT {
            return errdata!("invalid file length {file_len}");
        }
        let mut bytes = fs::read(path)?;
        let capacity = util::new_capacity(util::page_size(), file_len)?;
        bytes.resize(capacity, 0);
        self.buffer = Buffer::from_vec(bytes);

        let packed = self.buffer.get_u32_at(0);
        if packed & 0x8000_0000 != 0 {
            return errdata!("invalid packed size");
        }
        let data_size = (packed & 0x0FFF_FFFF) as usize;
        let had_encrypted = packed & CIPHER_MASK != 0;
        if data_size > file_len - DATA_START {
            return errdata!("data size exceeds file length");
        }
        let stored = self.buffer.get_u64_at(4);
        if stored != self.buffer.checksum(DATA_START, data_size) {
            return errdata!("checksum mismatch");
        }
        self.data_end = DATA_START + data_size;
        self.parse_data(had_encrypted)?;
        self.checksum = stored;
        Ok(())
    }

    fn require(&self, need: usize) -> Result<()> {
        if self.buffer.position + need > self.data_end {
            return errdata!("parse data failed");
        }
        Ok(())
    }

    /// Walks the records in `[DATA_START, data_end)`, rebuilding the index
    /// and the tombstone ledger.
    pub(crate) fn parse_data(&mut self, had_encrypted: bool) -> Result<()> {
        if had_encrypted && self.cipher.is_none() {
            return errdata!("miss cipher");
        }
        let data_cipher = if had_encrypted { self.cipher.clone() } else { None };

        self.data.clear();
        self.invalids.clear();
        self.buffer.position = DATA_START;
        while self.buffer.position < self.data_end {
            let start = self.buffer.position;
            self.require(2)?;
            let info = self.buffer.get_u8();
            let type_tag = info & data_type::TYPE_MASK;
            if !(data_type::BOOLEAN..=data_type::OBJECT).contains(&type_tag) {
                return errdata!("parse data failed");
            }
            let key_size = self.buffer.get_u8() as usize;
            if key_size == 0 {
                return errdata!("invalid key size");
            }

            if info & data_type::DELETE_MASK != 0 {
                self.require(key_size)?;
                self.buffer.position += key_size;
                let value_size = if type_tag <= data_type::DOUBLE {
                    data_type::TYPE_SIZE[type_tag as usize]
                } else {
                    self.require(2)?;
                    self.buffer.get_u16() as usize
                };
                self.require(value_size)?;
                self.buffer.position += value_size;
                self.invalids.count(start, self.buffer.position);
                continue;
            }

            self.require(key_size)?;
            let key_bytes = self.buffer.get_bytes(key_size);
            let key = match &data_cipher {
                Some(cipher) => String::from_utf8(cipher.decrypt(&key_bytes)?)?,
                None => String::from_utf8(key_bytes)?,
            };
            let pos = self.buffer.position;

            if type_tag <= data_type::DOUBLE {
                self.require(data_type::TYPE_SIZE[type_tag as usize])?;
                let entry = match type_tag {
                    data_type::BOOLEAN => Entry::Bool {
                        offset: pos,
                        value: self.buffer.get_u8() == 1,
                    },
                    data_type::INT => {
                        let raw = self.buffer.get_i32();
                        let value = data_cipher.as_ref().map_or(raw, |c| c.decrypt_i32(raw));
                        Entry::Int { offset: pos, value }
                    }
                    data_type::FLOAT => {
                        let raw = self.buffer.get_i32();
                        let raw = data_cipher.as_ref().map_or(raw, |c| c.decrypt_i32(raw));
                        Entry::Float { offset: pos, value: f32::from_bits(raw as u32) }
                    }
                    data_type::LONG => {
                        let raw = self.buffer.get_i64();
                        let value = data_cipher.as_ref().map_or(raw, |c| c.decrypt_i64(raw));
                        Entry::Long { offset: pos, value }
                    }
                    _ => {
                        let raw = self.buffer.get_i64();
                        let raw = data_cipher.as_ref().map_or(raw, |c| c.decrypt_i64(raw));
                        Entry::Double { offset: pos, value: f64::from_bits(raw as u64) }
                    }
                };
                self.data.insert(key, entry);
                continue;
            }

            self.require(2)?;
            let size = self.buffer.get_u16() as usize;
            let external = info & data_type::EXTERNAL_MASK != 0;
            if external && size != util::NAME_SIZE {
                return errdata!("name size not match");
            }
            self.require(size)?;
            let meta = VarMeta {
                start,
                offset: pos + 2,
                value_size: size,
                external,
            };
            match type_tag {
                data_type::STRING => {
                    let value = if external {
                        VarValue::External(self.buffer.get_str(size)?)
                    } else {
                        let bytes = self.buffer.get_bytes(size);
                        let bytes = match &data_cipher {
                            Some(cipher) => cipher.decrypt(&bytes)?,
                            None => bytes,
                        };
                        VarValue::Inline(String::from_utf8(bytes)?)
                    };
                    self.data.insert(key, Entry::Str { meta, value });
                }
                data_type::ARRAY => {
                    let value = if external {
                        VarValue::External(self.buffer.get_str(size)?)
                    } else {
                        let bytes = self.buffer.get_bytes(size);
                        let bytes = match &data_cipher {
                            Some(cipher) => cipher.decrypt(&bytes)?,
                            None => bytes,
                        };
                        VarValue::Inline(bytes)
                    };
                    self.data.insert(key, Entry::Array { meta, value });
                }
                _ => {
                    if external {
                        let file = self.buffer.get_str(size)?;
                        self.data.insert(
                            key,
                            Entry::Object { meta, value: VarValue::External(file), encoder: None },
                        );
                    } else {
                        self.parse_object(&key, meta, size, &data_cipher)?;
                        self.buffer.position = pos + 2 + size;
                    }
                }
            }
        }

        if self.buffer.position != self.data_end {
            return errdata!("parse data failed");
        }
        self.need_rewrite =
            !had_encrypted && self.cipher.is_some() && self.data_end != DATA_START;
        Ok(())
    }

    /// An inline OBJECT payload is `{tagSize, tag, encoded object}`. A
    /// missing or failing encoder skips the key but leaves the record live
    /// on disk; a later open with the encoder registered resurrects it.
    fn parse_object(
        &mut self,
        key: &str,
        meta: VarMeta,
        size: usize,
        data_cipher: &Option<Arc<dyn crate::cipher::Cipher>>,
    ) -> Result<()> {
        let raw = self.buffer.hb[self.buffer.position..self.buffer.position + size].to_vec();
        let bytes = match data_cipher {
            Some(cipher) => cipher.decrypt(&raw)?,
            None => raw,
        };
        if bytes.is_empty() {
            return errdata!("parse data failed");
        }
        let tag_size = bytes[0] as usize;
        if 1 + tag_size > bytes.len() {
            return errdata!("parse data failed");
        }
        let tag = String::from_utf8(bytes[1..1 + tag_size].to_vec())?;
        match self.registry.get(&tag) {
            None => {
                tracing::error!(name = %self.name, tag = %tag, "object with tag has no encoder");
            }
            Some(encoder) => match encoder.decode(&bytes[1 + tag_size..]) {
                Ok(obj) => {
                    self.data.insert(
                        key.to_string(),
                        Entry::Object {
                            meta,
                            value: VarValue::Inline(Arc::from(obj)),
                            encoder: Some(encoder),
                        },
                    );
                }
                Err(e) => {
                    tracing::error!(name = %self.name, tag = %tag, error = %e, "object decode failed");
                }
            },
        }
        Ok(())
    }
}
