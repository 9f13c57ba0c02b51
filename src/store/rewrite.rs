use std::sync::Arc;

use crate::buffer::Buffer;
use crate::config::{Config, Mode};
use crate::encoder::Encoder;
use crate::entry::{Entry, ObjectValue, VarValue};
use crate::error::Result;
use crate::util;

use super::engine::Engine;
use super::io::Backend;
use super::recovery::TEMP_PREFIX;

/// One owned key-value snapshot taken from the unencrypted image.
enum Item {
    Bool(bool),
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    StrInline(String),
    ArrayInline(Vec<u8>),
    ObjectInline(ObjectValue, Option<Arc<dyn Encoder>>),
    StrExternal(String),
    ArrayExternal(String),
    ObjectExternal(String),
}

/// Re-encodes an existing unencrypted store under the newly configured
/// cipher. Every entry is re-put into a scratch engine rooted at
/// `temp_<name>` (memory image, blocking sidecar writes), whose state is
/// then adopted wholesale and persisted atomically.
pub(crate) fn rewrite(engine: &mut Engine) -> Result<()> {
    let temp_name = format!("{}{}", TEMP_PREFIX, engine.name);
    let mut temp = Engine::new(
        engine.path.clone(),
        temp_name.clone(),
        engine.registry.clone(),
        engine.cipher.clone(),
        Config {
            mode: Mode::SyncBlocking,
            internal_limit: engine.config.internal_limit,
        },
        Arc::clone(&engine.executor),
        Backend::Memory,
        true,
    );

    let snapshot: Vec<(String, Item)> = engine
        .data
        .iter()
        .map(|(key, entry)| {
            let item = match entry {
                Entry::Bool { value, .. } => Item::Bool(*value),
                Entry::Int { value, .. } => Item::Int(*value),
                Entry::Float { value, .. } => Item::Float(*value),
                Entry::Long { value, .. } => Item::Long(*value),
                Entry::Double { value, .. } => Item::Double(*value),
                Entry::Str { value, .. } => match value {
                    VarValue::Inline(s) => Item::StrInline(s.clone()),
                    VarValue::External(file) => Item::StrExternal(file.clone()),
                },
                Entry::Array { value, .. } => match value {
                    VarValue::Inline(a) => Item::ArrayInline(a.clone()),
                    VarValue::External(file) => Item::ArrayExternal(file.clone()),
                },
                Entry::Object { value, encoder, .. } => match value {
                    VarValue::Inline(obj) => Item::ObjectInline(obj.clone(), encoder.clone()),
                    VarValue::External(file) => Item::ObjectExternal(file.clone()),
                },
            };
            (key.clone(), item)
        })
        .collect();

    let mut old_external_files = Vec::new();
    for (key, item) in snapshot {
        match item {
            Item::Bool(v) => temp.put_bool(&key, v)?,
            Item::Int(v) => temp.put_int(&key, v)?,
            Item::Float(v) => temp.put_float(&key, v)?,
            Item::Long(v) => temp.put_long(&key, v)?,
            Item::Double(v) => temp.put_double(&key, v)?,
            Item::StrInline(s) => temp.put_string(&key, &s)?,
            Item::ArrayInline(a) => temp.put_array(&key, &a)?,
            Item::ObjectInline(obj, Some(encoder)) => temp.put_object(&key, obj, encoder)?,
            Item::ObjectInline(_, None) => {}
            Item::StrExternal(file) => {
                // The old sidecars predate the cipher, so read them raw.
                let value = engine
                    .external_bytes(&file, false)
                    .and_then(|bytes| String::from_utf8(bytes).ok())
                    .filter(|s| !s.is_empty());
                old_external_files.push(file);
                if let Some(s) = value {
                    temp.put_string(&key, &s)?;
                }
            }
            Item::ArrayExternal(file) => {
                let value = engine.external_bytes(&file, false).filter(|b| !b.is_empty());
                old_external_files.push(file);
                if let Some(bytes) = value {
                    temp.put_array(&key, &bytes)?;
                }
            }
            Item::ObjectExternal(file) => {
                let payload = engine.external_bytes(&file, false);
                old_external_files.push(file);
                if let Some(bytes) = payload {
                    if let Some((obj, encoder)) = decode_plain_object(engine, &bytes) {
                        temp.put_object(&key, obj, encoder)?;
                    }
                }
            }
        }
    }

    // Adopt the scratch engine's state.
    engine.buffer = std::mem::replace(&mut temp.buffer, Buffer::new(0));
    engine.checksum = temp.checksum;
    engine.data_end = temp.data_end;
    engine.data = std::mem::take(&mut temp.data);
    engine.invalids.clear();
    engine.external_cache.clear();
    engine.backend.replace_all(&engine.buffer.hb)?;

    // Migrate the freshly written sidecars and drop the plaintext ones.
    let temp_dir = engine.path.join(&temp_name);
    let current_dir = engine.external_dir();
    util::move_dir_files(&temp_dir, &current_dir)?;
    let _ = util::delete_dir(&temp_dir);
    for file in old_external_files {
        if let Err(e) = util::delete_file(&current_dir.join(&file)) {
            tracing::warn!(name = %engine.name, error = %e, "plaintext sidecar delete failed");
        }
    }

    engine.need_rewrite = false;
    tracing::info!(name = %engine.name, "encryption rewrite finish");
    Ok(())
}

/// Decodes an unencrypted `{tagSize, tag, bytes}` object payload.
fn decode_plain_object(
    engine: &Engine,
    bytes: &[u8],
) -> Option<(ObjectValue, Arc<dyn Encoder>)> {
    if bytes.is_empty() {
        return None;
    }
    let tag_size = bytes[0] as usize;
    if 1 + tag_size > bytes.len() {
        return None;
    }
    let tag = std::str::from_utf8(&bytes[1..1 + tag_size]).ok()?;
    let encoder = engine.registry.get(tag)?;
    match encoder.decode(&bytes[1 + tag_size..]) {
        Ok(obj) => Some((Arc::from(obj), encoder)),
        Err(e) => {
            tracing::error!(name = %engine.name, tag = %tag, error = %e, "object decode failed");
            None
        }
    }
}
