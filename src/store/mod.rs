mod engine;
mod io;
mod recovery;
mod rewrite;

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cipher::Cipher;
use crate::config::{Config, Mode};
use crate::encoder::{Encoder, Registry};
use crate::error::Result;
use crate::executor::TagExecutor;

use engine::Engine;
use io::Backend;

pub use crate::entry::ObjectValue;

/// A dynamically typed value, as handed out by [Store::get_all] and accepted
/// by [Store::put_all].
#[derive(Clone)]
pub enum Value {
    Bool(bool),
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Str(String),
    Array(Vec<u8>),
    StringSet(HashSet<String>),
    Object { tag: String, value: ObjectValue },
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "Bool({v})"),
            Value::Int(v) => write!(f, "Int({v})"),
            Value::Float(v) => write!(f, "Float({v})"),
            Value::Long(v) => write!(f, "Long({v})"),
            Value::Double(v) => write!(f, "Double({v})"),
            Value::Str(v) => write!(f, "Str({v:?})"),
            Value::Array(v) => write!(f, "Array({} bytes)", v.len()),
            Value::StringSet(v) => write!(f, "StringSet({v:?})"),
            Value::Object { tag, .. } => write!(f, "Object(tag: {tag:?})"),
        }
    }
}

/// Opens a [Store] with optional encoders, a cipher, and a durability mode.
pub struct StoreBuilder {
    path: PathBuf,
    name: String,
    encoders: Vec<Arc<dyn Encoder>>,
    cipher: Option<Arc<dyn Cipher>>,
    config: Config,
}

impl StoreBuilder {
    /// Registers a codec for user-defined object values.
    pub fn encoder(mut self, encoder: Arc<dyn Encoder>) -> Self {
        self.encoders.push(encoder);
        self
    }

    /// Encrypts keys, values and sidecar files with the given cipher. An
    /// existing unencrypted store is rewritten on open.
    pub fn cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Encoded values at or above this many bytes spill to sidecar files.
    pub fn internal_limit(mut self, limit: usize) -> Self {
        self.config.internal_limit = limit;
        self
    }

    pub fn open(self) -> Result<Store> {
        let registry = Registry::new(self.encoders);
        let executor = Arc::new(TagExecutor::new()?);
        let blocking_external = self.config.mode == Mode::SyncBlocking;
        let mut engine = Engine::new(
            self.path,
            self.name,
            registry,
            self.cipher,
            self.config,
            executor,
            Backend::Memory,
            blocking_external,
        );
        engine.load()?;
        Ok(Store {
            inner: Mutex::new(engine),
        })
    }
}

/// An embedded key-value store persisting typed primitives and blobs to a
/// local log file.
///
/// Every operation takes the store-wide lock for its duration; readers and
/// writers never run concurrently. Reads resolve from the in-memory index
/// and never fail: a missing key, a key of another type, or an unreadable
/// sidecar all yield the default. Puts fail only on caller mistakes (empty
/// or oversize keys, unregistered encoders, a store past 256 MiB).
pub struct Store {
    inner: Mutex<Engine>,
}

impl Store {
    /// Opens (or creates) the store `<name>` under `<path>` with default
    /// configuration.
    pub fn open(path: impl AsRef<Path>, name: &str) -> Result<Store> {
        Self::builder(path, name).open()
    }

    pub fn builder(path: impl AsRef<Path>, name: &str) -> StoreBuilder {
        StoreBuilder {
            path: path.as_ref().to_path_buf(),
            name: name.to_string(),
            encoders: Vec::new(),
            cipher: None,
            config: Config::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Engine> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains(key)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get_bool_or(key, false)
    }

    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.lock().get_bool(key).unwrap_or(default)
    }

    pub fn get_int(&self, key: &str) -> i32 {
        self.get_int_or(key, 0)
    }

    pub fn get_int_or(&self, key: &str, default: i32) -> i32 {
        self.lock().get_int(key).unwrap_or(default)
    }

    pub fn get_float(&self, key: &str) -> f32 {
        self.get_float_or(key, 0.0)
    }

    pub fn get_float_or(&self, key: &str, default: f32) -> f32 {
        self.lock().get_float(key).unwrap_or(default)
    }

    pub fn get_long(&self, key: &str) -> i64 {
        self.get_long_or(key, 0)
    }

    pub fn get_long_or(&self, key: &str, default: i64) -> i64 {
        self.lock().get_long(key).unwrap_or(default)
    }

    pub fn get_double(&self, key: &str) -> f64 {
        self.get_double_or(key, 0.0)
    }

    pub fn get_double_or(&self, key: &str, default: f64) -> f64 {
        self.lock().get_double(key).unwrap_or(default)
    }

    pub fn get_string(&self, key: &str) -> String {
        self.get_string_or(key, "")
    }

    pub fn get_string_or(&self, key: &str, default: &str) -> String {
        self.lock()
            .get_string(key)
            .unwrap_or_else(|| default.to_string())
    }

    pub fn get_array(&self, key: &str) -> Vec<u8> {
        self.get_array_or(key, &[])
    }

    pub fn get_array_or(&self, key: &str, default: &[u8]) -> Vec<u8> {
        self.lock()
            .get_array(key)
            .unwrap_or_else(|| default.to_vec())
    }

    pub fn get_string_set(&self, key: &str) -> HashSet<String> {
        self.lock().get_string_set(key).unwrap_or_default()
    }

    /// Retrieves a user object decoded by its registered encoder, downcast
    /// to the requested type.
    pub fn get_object<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.lock()
            .get_object(key)
            .and_then(|(_, obj)| obj.downcast_ref::<T>().cloned())
    }

    pub fn put_bool(&self, key: &str, value: bool) -> Result<()> {
        self.lock().put_bool(key, value)
    }

    pub fn put_int(&self, key: &str, value: i32) -> Result<()> {
        self.lock().put_int(key, value)
    }

    pub fn put_float(&self, key: &str, value: f32) -> Result<()> {
        self.lock().put_float(key, value)
    }

    pub fn put_long(&self, key: &str, value: i64) -> Result<()> {
        self.lock().put_long(key, value)
    }

    pub fn put_double(&self, key: &str, value: f64) -> Result<()> {
        self.lock().put_double(key, value)
    }

    pub fn put_string(&self, key: &str, value: &str) -> Result<()> {
        self.lock().put_string(key, value)
    }

    pub fn put_array(&self, key: &str, value: &[u8]) -> Result<()> {
        self.lock().put_array(key, value)
    }

    pub fn put_string_set(&self, key: &str, value: HashSet<String>) -> Result<()> {
        self.lock().put_string_set(key, value)
    }

    /// Stores a user object through the given encoder, which must be
    /// registered with the store.
    pub fn put_object<T: Any + Send + Sync>(
        &self,
        key: &str,
        value: T,
        encoder: Arc<dyn Encoder>,
    ) -> Result<()> {
        self.lock().put_object(key, Arc::new(value), encoder)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.lock().remove(key)
    }

    /// Drops every key and resets the backing files and sidecar directory.
    pub fn clear(&self) -> Result<()> {
        self.lock().clear()
    }

    /// Snapshot of every live key, with external values decoded.
    pub fn get_all(&self) -> HashMap<String, Value> {
        self.lock().get_all()
    }

    /// Batch put. Empty keys are skipped; objects with unregistered tags are
    /// logged and skipped.
    pub fn put_all(&self, values: HashMap<String, Value>) -> Result<()> {
        self.lock().put_all(values)
    }

    /// Forces buffered state to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.lock().sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::testing::XorStreamCipher;
    use crate::entry::{DATA_START, CIPHER_MASK};
    use crate::util;
    use byteorder::{ByteOrder, LittleEndian};
    use serde::{Deserialize, Serialize};
    use std::io::{Seek, SeekFrom, Write};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        id: u64,
        email: String,
    }

    struct ProfileEncoder;

    impl Encoder for ProfileEncoder {
        fn tag(&self) -> &str {
            "Profile"
        }

        fn encode(&self, value: &dyn Any) -> Result<Vec<u8>> {
            let profile = value
                .downcast_ref::<Profile>()
                .ok_or_else(|| crate::error::Error::InvalidInput("not a profile".into()))?;
            Ok(bincode::serialize(profile)?)
        }

        fn decode(&self, bytes: &[u8]) -> Result<Box<dyn Any + Send + Sync>> {
            let profile: Profile = bincode::deserialize(bytes)?;
            Ok(Box::new(profile))
        }
    }

    fn checksum_holds(store: &Store) -> bool {
        let engine = store.lock();
        let data_size = engine.data_end - DATA_START;
        engine.buffer.checksum(DATA_START, data_size) == engine.checksum
    }

    #[test]
    fn test_int_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path(), "settings").unwrap();
            store.put_int("n", 42).unwrap();
        }
        let store = Store::open(dir.path(), "settings").unwrap();
        assert_eq!(store.get_int_or("n", 0), 42);
    }

    #[test]
    fn test_round_trip_every_type() {
        let dir = tempfile::tempdir().unwrap();
        let set: HashSet<String> = ["alpha", "beta"].iter().map(|s| s.to_string()).collect();
        let profile = Profile { id: 7, email: "a@b.c".into() };
        {
            let store = Store::builder(dir.path(), "all")
                .encoder(Arc::new(ProfileEncoder))
                .open()
                .unwrap();
            store.put_bool("b", true).unwrap();
            store.put_int("i", -123).unwrap();
            store.put_float("f", f32::from_bits(0x7FC0_1234)).unwrap(); // NaN payload
            store.put_long("l", i64::MIN).unwrap();
            store.put_double("d", -0.0).unwrap();
            store.put_string("s", "héllo wörld").unwrap();
            store.put_array("a", &[0, 1, 255, 254]).unwrap();
            store.put_string_set("set", set.clone()).unwrap();
            store.put_object("p", profile.clone(), Arc::new(ProfileEncoder)).unwrap();
            assert!(checksum_holds(&store));
        }
        let store = Store::builder(dir.path(), "all")
            .encoder(Arc::new(ProfileEncoder))
            .open()
            .unwrap();
        assert!(store.get_bool("b"));
        assert_eq!(store.get_int("i"), -123);
        assert_eq!(store.get_float("f").to_bits(), 0x7FC0_1234);
        assert_eq!(store.get_long("l"), i64::MIN);
        assert_eq!(store.get_double("d").to_bits(), (-0.0f64).to_bits());
        assert_eq!(store.get_string("s"), "héllo wörld");
        assert_eq!(store.get_array("a"), vec![0, 1, 255, 254]);
        assert_eq!(store.get_string_set("set"), set);
        assert_eq!(store.get_object::<Profile>("p").unwrap(), profile);
    }

    #[test]
    fn test_in_place_update_same_size() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), "kv").unwrap();
        store.put_string("s", "hello").unwrap();
        let data_end = store.lock().data_end;

        store.put_string("s", "world").unwrap();
        {
            let engine = store.lock();
            assert_eq!(engine.data_end, data_end);
            assert_eq!(engine.invalids.bytes(), 0);
        }
        assert!(checksum_holds(&store));
        assert_eq!(store.get_string("s"), "world");
    }

    #[test]
    fn test_shorter_overwrite_tombstones_old_record() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path(), "kv").unwrap();
            store.put_string("s", "hello").unwrap();
            // info(1) + keySize(1) + key(1) + valueSize(2) + value(5)
            let first_record = 10;
            let data_end = store.lock().data_end;
            assert_eq!(data_end, DATA_START + first_record);

            store.put_string("s", "hi").unwrap();
            let engine = store.lock();
            assert_eq!(engine.invalids.bytes(), first_record);
            assert_eq!(engine.data_end, DATA_START + first_record + 7);
            drop(engine);
            assert!(checksum_holds(&store));
        }
        let store = Store::open(dir.path(), "kv").unwrap();
        assert_eq!(store.get_string("s"), "hi");
        assert_eq!(store.lock().invalids.bytes(), 10);
    }

    #[test]
    fn test_fixed_updates_preserve_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), "kv").unwrap();
        store.put_int("i", 1).unwrap();
        store.put_int("i", 2).unwrap();
        store.put_bool("b", false).unwrap();
        store.put_bool("b", true).unwrap();
        store.put_long("l", 10).unwrap();
        store.put_long("l", -10).unwrap();
        store.put_double("d", 1.5).unwrap();
        store.put_double("d", 2.5).unwrap();
        assert!(checksum_holds(&store));

        // Unchanged values are no-ops.
        let data_end = store.lock().data_end;
        store.put_int("i", 2).unwrap();
        assert_eq!(store.lock().data_end, data_end);
    }

    #[test]
    fn test_remove_tombstones_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path(), "kv").unwrap();
            store.put_int("keep", 1).unwrap();
            store.put_int("drop", 2).unwrap();
            store.remove("drop").unwrap();
            assert!(!store.contains("drop"));
            assert!(checksum_holds(&store));
        }
        let store = Store::open(dir.path(), "kv").unwrap();
        assert_eq!(store.get_int("keep"), 1);
        assert!(!store.contains("drop"));
    }

    #[test]
    fn test_gc_compacts_and_preserves_survivors() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), "kv").unwrap();
        // Small records so the key-count threshold (80) fires before the
        // byte threshold.
        for i in 0..100 {
            store.put_string(&format!("key{i:03}"), &format!("value{i:03}")).unwrap();
        }
        for i in 0..80 {
            store.remove(&format!("key{i:03}")).unwrap();
        }
        // The 80th tombstone triggered a GC.
        {
            let engine = store.lock();
            assert!(engine.invalids.is_empty());
        }
        for i in 80..85 {
            store.remove(&format!("key{i:03}")).unwrap();
        }
        store.lock().gc().unwrap();

        let engine = store.lock();
        assert!(engine.invalids.is_empty());
        // 15 survivors: info(1) + keySize(1) + key(6) + valueSize(2) + value(8)
        assert_eq!(engine.data_end, DATA_START + 15 * 18);
        let data_size = engine.data_end - DATA_START;
        assert_eq!(engine.buffer.checksum(DATA_START, data_size), engine.checksum);
        drop(engine);

        for i in 85..100 {
            assert_eq!(store.get_string(&format!("key{i:03}")), format!("value{i:03}"));
        }
    }

    #[test]
    fn test_gc_survivors_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path(), "kv").unwrap();
            for i in 0..100 {
                store.put_string(&format!("key{i:03}"), &format!("value{i:03}")).unwrap();
            }
            for i in 0..85 {
                store.remove(&format!("key{i:03}")).unwrap();
            }
        }
        let store = Store::open(dir.path(), "kv").unwrap();
        for i in 85..100 {
            assert_eq!(store.get_string(&format!("key{i:03}")), format!("value{i:03}"));
        }
        assert_eq!(store.get_all().len(), 15);
    }

    #[test]
    fn test_large_value_spills_to_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let value = "x".repeat(5 * 1024);
        {
            let store = Store::builder(dir.path(), "kv")
                .internal_limit(4096)
                .open()
                .unwrap();
            store.put_string("big", &value).unwrap();

            let engine = store.lock();
            let meta = *engine.data.get("big").unwrap().var_meta().unwrap();
            assert!(meta.external);
            assert_eq!(meta.value_size, util::NAME_SIZE);
            let file = engine.data.get("big").unwrap().external_file().unwrap().to_string();
            drop(engine);

            // Read-your-write before the async writer lands goes through the
            // caches.
            assert_eq!(store.get_string("big"), value);

            store.lock().executor.wait_idle();
            let sidecar = dir.path().join("kv").join(&file);
            assert_eq!(std::fs::metadata(&sidecar).unwrap().len(), 5 * 1024);
        }
        let store = Store::builder(dir.path(), "kv")
            .internal_limit(4096)
            .open()
            .unwrap();
        assert_eq!(store.get_string("big"), value);
    }

    #[test]
    fn test_large_value_overwrite_deletes_old_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::builder(dir.path(), "kv")
            .internal_limit(4096)
            .open()
            .unwrap();
        store.put_array("blob", &vec![1u8; 8000]).unwrap();
        let first = store.lock().data.get("blob").unwrap().external_file().unwrap().to_string();

        store.put_array("blob", &vec![2u8; 9000]).unwrap();
        let second = store.lock().data.get("blob").unwrap().external_file().unwrap().to_string();
        assert_ne!(first, second);

        store.lock().executor.wait_idle();
        let side_dir = dir.path().join("kv");
        assert!(!side_dir.join(&first).exists());
        assert_eq!(std::fs::metadata(side_dir.join(&second)).unwrap().len(), 9000);
        assert_eq!(store.get_array("blob"), vec![2u8; 9000]);
    }

    #[test]
    fn test_missing_sidecar_drops_key() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::builder(dir.path(), "kv")
                .internal_limit(4096)
                .open()
                .unwrap();
            store.put_string("big", &"y".repeat(6000)).unwrap();
            store.lock().executor.wait_idle();
        }
        std::fs::remove_dir_all(dir.path().join("kv")).unwrap();

        let store = Store::builder(dir.path(), "kv")
            .internal_limit(4096)
            .open()
            .unwrap();
        assert!(store.contains("big"));
        assert_eq!(store.get_string_or("big", "fallback"), "fallback");
        // The dangling reference was removed on read.
        assert!(!store.contains("big"));
    }

    #[test]
    fn test_crash_recovery_from_sibling_file() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path(), "kv").unwrap();
            store.put_int("a", 1).unwrap();
            store.put_string("b", "two").unwrap();
            store.sync().unwrap();
        }
        // Corrupt the primary image mid-payload.
        let a_path = dir.path().join("kv.kva");
        {
            let mut file = std::fs::OpenOptions::new().write(true).open(&a_path).unwrap();
            file.seek(SeekFrom::Start(DATA_START as u64 + 3)).unwrap();
            file.write_all(b"garbage").unwrap();
            file.sync_all().unwrap();
        }

        let store = Store::open(dir.path(), "kv").unwrap();
        assert_eq!(store.get_int("a"), 1);
        assert_eq!(store.get_string("b"), "two");
        drop(store);

        // The corrupt image was repaired from its sibling.
        let a = std::fs::read(&a_path).unwrap();
        let b = std::fs::read(dir.path().join("kv.kvb")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_both_files_corrupt_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path(), "kv").unwrap();
            store.put_int("a", 1).unwrap();
            store.sync().unwrap();
        }
        for name in ["kv.kva", "kv.kvb"] {
            let path = dir.path().join(name);
            let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(4)).unwrap();
            file.write_all(&[0xFF; 8]).unwrap(); // trash the stored checksum
        }
        let store = Store::open(dir.path(), "kv").unwrap();
        assert!(!store.contains("a"));
        store.put_int("fresh", 9).unwrap();
        assert_eq!(store.get_int("fresh"), 9);
    }

    #[test]
    fn test_sync_blocking_mode_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::builder(dir.path(), "kv")
                .mode(Mode::SyncBlocking)
                .open()
                .unwrap();
            store.put_int("n", 5).unwrap();
            store.put_string("s", "sync").unwrap();
        }
        assert!(dir.path().join("kv.kvc").exists());
        let store = Store::builder(dir.path(), "kv")
            .mode(Mode::SyncBlocking)
            .open()
            .unwrap();
        assert_eq!(store.get_int("n"), 5);
        assert_eq!(store.get_string("s"), "sync");
    }

    #[test]
    fn test_non_sync_mode_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::builder(dir.path(), "kv")
                .mode(Mode::NonSync)
                .open()
                .unwrap();
            store.put_long("l", 77).unwrap();
        }
        assert!(!dir.path().join("kv.kvb").exists());
        let store = Store::builder(dir.path(), "kv")
            .mode(Mode::NonSync)
            .open()
            .unwrap();
        assert_eq!(store.get_long("l"), 77);
    }

    #[test]
    fn test_encrypted_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cipher = || Arc::new(XorStreamCipher::new(0xC0FFEE));
        {
            let store = Store::builder(dir.path(), "sec")
                .cipher(cipher())
                .open()
                .unwrap();
            store.put_int("i", 41).unwrap();
            store.put_string("s", "secret").unwrap();
            assert!(checksum_holds(&store));
        }
        // The image must not contain the plaintext.
        let image = std::fs::read(dir.path().join("sec.kva")).unwrap();
        assert!(!image.windows(6).any(|w| w == b"secret"));
        assert!(LittleEndian::read_u32(&image[..4]) & CIPHER_MASK != 0);

        let store = Store::builder(dir.path(), "sec")
            .cipher(cipher())
            .open()
            .unwrap();
        assert_eq!(store.get_int("i"), 41);
        assert_eq!(store.get_string("s"), "secret");
    }

    #[test]
    fn test_encryption_upgrade_rewrites_store() {
        let dir = tempfile::tempdir().unwrap();
        let big = "z".repeat(6000);
        {
            let store = Store::builder(dir.path(), "up")
                .internal_limit(4096)
                .open()
                .unwrap();
            store.put_int("i", 1).unwrap();
            store.put_string("s", "plain").unwrap();
            store.put_string("big", &big).unwrap();
            store.lock().executor.wait_idle();
        }
        let cipher = Arc::new(XorStreamCipher::new(7));
        let store = Store::builder(dir.path(), "up")
            .internal_limit(4096)
            .cipher(cipher.clone())
            .open()
            .unwrap();
        assert_eq!(store.get_int("i"), 1);
        assert_eq!(store.get_string("s"), "plain");
        assert_eq!(store.get_string("big"), big);
        drop(store);

        // The rewritten image is flagged encrypted and carries no plaintext.
        let image = std::fs::read(dir.path().join("up.kva")).unwrap();
        assert!(LittleEndian::read_u32(&image[..4]) & CIPHER_MASK != 0);
        assert!(!image.windows(5).any(|w| w == b"plain"));
        assert!(!dir.path().join("temp_up").exists());

        // And it parses back with the cipher.
        let store = Store::builder(dir.path(), "up")
            .internal_limit(4096)
            .cipher(cipher)
            .open()
            .unwrap();
        assert_eq!(store.get_string("big"), big);
    }

    #[test]
    fn test_unknown_object_tag_preserved_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let profile = Profile { id: 1, email: "x@y.z".into() };
        {
            let store = Store::builder(dir.path(), "kv")
                .encoder(Arc::new(ProfileEncoder))
                .open()
                .unwrap();
            store.put_object("p", profile.clone(), Arc::new(ProfileEncoder)).unwrap();
        }
        {
            // Without the encoder the slot is absent but the record stays.
            let store = Store::open(dir.path(), "kv").unwrap();
            assert!(!store.contains("p"));
        }
        let store = Store::builder(dir.path(), "kv")
            .encoder(Arc::new(ProfileEncoder))
            .open()
            .unwrap();
        assert_eq!(store.get_object::<Profile>("p").unwrap(), profile);
    }

    #[test]
    fn test_get_all_and_put_all() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), "kv").unwrap();
        let mut values = HashMap::new();
        values.insert("b".to_string(), Value::Bool(true));
        values.insert("i".to_string(), Value::Int(3));
        values.insert("s".to_string(), Value::Str("str".into()));
        values.insert(
            "set".to_string(),
            Value::StringSet(["one".to_string()].into_iter().collect()),
        );
        values.insert(String::new(), Value::Int(9)); // skipped
        store.put_all(values).unwrap();

        let all = store.get_all();
        assert_eq!(all.len(), 4);
        assert!(matches!(all.get("b"), Some(Value::Bool(true))));
        assert!(matches!(all.get("i"), Some(Value::Int(3))));
        assert!(matches!(all.get("s"), Some(Value::Str(s)) if s == "str"));
        assert!(matches!(all.get("set"), Some(Value::StringSet(s)) if s.len() == 1));
    }

    #[test]
    fn test_argument_faults() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), "kv").unwrap();
        assert!(store.put_int("", 1).is_err());
        assert!(store.put_string(&"k".repeat(256), "v").is_err());

        store.put_int("n", 1).unwrap();
        assert!(store.put_string("n", "oops").is_err());
        // Reads of a mismatched type return the default instead of failing.
        assert_eq!(store.get_string_or("n", "default"), "default");
    }

    #[test]
    fn test_clear_resets_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::builder(dir.path(), "kv")
            .internal_limit(4096)
            .open()
            .unwrap();
        store.put_int("i", 1).unwrap();
        store.put_string("big", &"w".repeat(5000)).unwrap();
        store.clear().unwrap();

        assert!(!store.contains("i"));
        assert!(!store.contains("big"));
        assert!(!dir.path().join("kv").exists());
        assert_eq!(store.lock().data_end, DATA_START);

        store.put_int("i", 2).unwrap();
        assert_eq!(store.get_int("i"), 2);
    }

    #[test]
    fn test_capacity_growth_and_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), "kv").unwrap();
        // Push the image well past several capacity doublings.
        for i in 0..200 {
            store.put_string(&format!("k{i}"), &"v".repeat(600)).unwrap();
        }
        let grown = store.lock().buffer.capacity();
        assert!(grown > util::page_size());
        assert!(checksum_holds(&store));

        for i in 0..200 {
            store.remove(&format!("k{i}")).unwrap();
        }
        store.lock().gc().unwrap();
        let engine = store.lock();
        assert_eq!(engine.data_end, DATA_START);
        assert!(engine.buffer.capacity() < grown);
    }
}
