//! 集成测试共用的内存存储，支持注入故障

#![allow(dead_code)]

use async_trait::async_trait;
use bucketsync::error::{StorageError, StorageResult};
use bucketsync::storage::{
    md5_hex, FileEntry, Fingerprint, MultipartSession, PartAck, PartLimits, Storage,
};
use bucketsync::SyncConfig;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

struct Object {
    data: Bytes,
    fingerprint: Fingerprint,
    modified_at: DateTime<Utc>,
}

#[derive(Default)]
struct Faults {
    /// 每个路径剩余的失败写入次数
    fail_writes: HashMap<String, u32>,
    /// 每个路径剩余的写坏内容次数
    corrupt_writes: HashMap<String, u32>,
    /// 总是失败的分片序号
    fail_parts: HashSet<u32>,
    /// 永远不返回的分片序号
    stall_parts: HashSet<u32>,
    /// 分片对象也报告内容 MD5（类似本地存储）
    md5_multipart: bool,
    fail_list: bool,
    fail_deletes: HashSet<String>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Object>,
    sessions: HashMap<String, BTreeMap<u32, Bytes>>,
}

/// 类似对象存储的后端：扁平的 key，没有目录；分片上传的对象和 S3 一样使用 `md5-N` 标记而不是内容 MD5
pub struct MemoryStorage {
    name: String,
    state: Mutex<State>,
    faults: Mutex<Faults>,
    aborts: AtomicUsize,
    write_calls: AtomicUsize,
    next_session: AtomicUsize,
    part_limits: Mutex<PartLimits>,
    stalled: Notify,
}

impl MemoryStorage {
    pub fn new(name: &str) -> Self {
        Self {
            name: format!("memory:{}", name),
            state: Mutex::new(State::default()),
            faults: Mutex::new(Faults::default()),
            aborts: AtomicUsize::new(0),
            write_calls: AtomicUsize::new(0),
            next_session: AtomicUsize::new(1),
            part_limits: Mutex::new(PartLimits::default()),
            stalled: Notify::new(),
        }
    }

    pub fn put(&self, key: &str, data: &[u8]) {
        self.put_at(key, data, Utc::now());
    }

    pub fn put_at(&self, key: &str, data: &[u8], modified_at: DateTime<Utc>) {
        let object = Object {
            data: Bytes::copy_from_slice(data),
            fingerprint: Fingerprint::Md5(md5_hex(data)),
            modified_at,
        };
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(key.to_string(), object);
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(key)
            .map(|o| o.data.to_vec())
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().unwrap().objects.keys().cloned().collect()
    }

    pub fn open_sessions(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    pub fn fail_writes(&self, key: &str, times: u32) {
        self.faults
            .lock()
            .unwrap()
            .fail_writes
            .insert(key.to_string(), times);
    }

    pub fn corrupt_writes(&self, key: &str, times: u32) {
        self.faults
            .lock()
            .unwrap()
            .corrupt_writes
            .insert(key.to_string(), times);
    }

    pub fn fail_part_always(&self, index: u32) {
        self.faults.lock().unwrap().fail_parts.insert(index);
    }

    /// 上传该分片时一直挂起，直到调用方放弃
    pub fn stall_part(&self, index: u32) {
        self.faults.lock().unwrap().stall_parts.insert(index);
    }

    /// 等到某个分片已经挂起
    pub async fn part_stalled(&self) {
        self.stalled.notified().await;
    }

    pub fn report_md5_for_multipart(&self) {
        self.faults.lock().unwrap().md5_multipart = true;
    }

    pub fn set_part_limits(&self, limits: PartLimits) {
        *self.part_limits.lock().unwrap() = limits;
    }

    /// 对象的指纹
    pub fn fingerprint(&self, key: &str) -> Option<Fingerprint> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(key)
            .map(|o| o.fingerprint.clone())
    }

    pub fn fail_list(&self) {
        self.faults.lock().unwrap().fail_list = true;
    }

    pub fn fail_delete(&self, key: &str) {
        self.faults
            .lock()
            .unwrap()
            .fail_deletes
            .insert(key.to_string());
    }

    pub fn abort_calls(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    fn take_fault(map: &mut HashMap<String, u32>, key: &str) -> bool {
        match map.get_mut(key) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }

    fn corrupt(data: Bytes) -> Bytes {
        let mut bytes = data.to_vec();
        match bytes.first_mut() {
            Some(b) => *b ^= 0xff,
            None => bytes.push(0),
        }
        Bytes::from(bytes)
    }

    fn entry(key: &str, object: &Object) -> FileEntry {
        FileEntry {
            path: key.to_string(),
            size: object.data.len() as u64,
            fingerprint: Some(object.fingerprint.clone()),
            modified_at: Some(object.modified_at),
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn list<'a>(&'a self, prefix: &'a str) -> BoxStream<'a, StorageResult<FileEntry>> {
        if self.faults.lock().unwrap().fail_list {
            return stream::once(async { Err(StorageError::Backend("list refused".into())) })
                .boxed();
        }

        let entries: Vec<StorageResult<FileEntry>> = self
            .state
            .lock()
            .unwrap()
            .objects
            .iter()
            .filter(|(key, _)| {
                prefix.is_empty()
                    || key
                        .strip_prefix(prefix)
                        .is_some_and(|rest| rest.starts_with('/'))
            })
            .map(|(key, object)| Ok(Self::entry(key, object)))
            .collect();
        stream::iter(entries).boxed()
    }

    async fn stat(&self, path: &str) -> StorageResult<Option<FileEntry>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .objects
            .get(path)
            .map(|o| Self::entry(path, o)))
    }

    async fn read_chunk(&self, path: &str, offset: u64, length: u64) -> StorageResult<Bytes> {
        let state = self.state.lock().unwrap();
        let object = state
            .objects
            .get(path)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        let start = (offset as usize).min(object.data.len());
        let end = (start + length as usize).min(object.data.len());
        Ok(object.data.slice(start..end))
    }

    async fn write(&self, path: &str, data: Bytes) -> StorageResult<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);

        let corrupt = {
            let mut faults = self.faults.lock().unwrap();
            if Self::take_fault(&mut faults.fail_writes, path) {
                return Err(StorageError::Backend(format!("injected write failure: {}", path)));
            }
            Self::take_fault(&mut faults.corrupt_writes, path)
        };

        let stored = if corrupt { Self::corrupt(data) } else { data };

        let object = Object {
            fingerprint: Fingerprint::Md5(md5_hex(&stored)),
            data: stored,
            modified_at: Utc::now(),
        };
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(path.to_string(), object);
        Ok(())
    }

    async fn begin_multipart(&self, path: &str) -> StorageResult<MultipartSession> {
        let id = format!("upload-{}", self.next_session.fetch_add(1, Ordering::SeqCst));
        self.state
            .lock()
            .unwrap()
            .sessions
            .insert(id.clone(), BTreeMap::new());
        Ok(MultipartSession {
            id,
            path: path.to_string(),
        })
    }

    async fn upload_part(
        &self,
        session: &MultipartSession,
        index: u32,
        data: Bytes,
    ) -> StorageResult<PartAck> {
        let stall = {
            let faults = self.faults.lock().unwrap();
            if faults.fail_parts.contains(&index) {
                return Err(StorageError::Backend(format!("injected part failure: {}", index)));
            }
            faults.stall_parts.contains(&index)
        };
        if stall {
            self.stalled.notify_one();
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock().unwrap();
        let parts = state
            .sessions
            .get_mut(&session.id)
            .ok_or_else(|| StorageError::NotFound(session.id.clone()))?;
        let ack = PartAck {
            index,
            tag: md5_hex(&data),
            size: data.len() as u64,
        };
        parts.insert(index, data);
        Ok(ack)
    }

    async fn complete_multipart(
        &self,
        session: MultipartSession,
        parts: Vec<PartAck>,
    ) -> StorageResult<()> {
        let (corrupt, md5_multipart) = {
            let mut faults = self.faults.lock().unwrap();
            (
                Self::take_fault(&mut faults.corrupt_writes, &session.path),
                faults.md5_multipart,
            )
        };

        let mut state = self.state.lock().unwrap();
        let uploaded = state
            .sessions
            .remove(&session.id)
            .ok_or_else(|| StorageError::NotFound(session.id.clone()))?;

        let mut data = Vec::new();
        for ack in &parts {
            let part = uploaded
                .get(&ack.index)
                .ok_or_else(|| StorageError::Backend(format!("missing part {}", ack.index)))?;
            data.extend_from_slice(part);
        }

        let mut data = Bytes::from(data);
        if corrupt {
            data = Self::corrupt(data);
        }
        let fingerprint = if md5_multipart {
            Fingerprint::Md5(md5_hex(&data))
        } else {
            Fingerprint::Opaque(format!("{}-{}", md5_hex(&data), parts.len()))
        };
        let object = Object {
            fingerprint,
            data,
            modified_at: Utc::now(),
        };
        state.objects.insert(session.path, object);
        Ok(())
    }

    async fn abort_multipart(&self, session: MultipartSession) -> StorageResult<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.state.lock().unwrap().sessions.remove(&session.id);
        Ok(())
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        if self.faults.lock().unwrap().fail_deletes.contains(path) {
            return Err(StorageError::Backend(format!("injected delete failure: {}", path)));
        }
        self.state.lock().unwrap().objects.remove(path);
        Ok(())
    }

    fn part_limits(&self) -> PartLimits {
        *self.part_limits.lock().unwrap()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// 测试用配置，重试延迟很短
pub fn test_config() -> SyncConfig {
    SyncConfig {
        max_attempts: 3,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        ..Default::default()
    }
}
