//! Handle registry.
//!
//! Maps opaque ids to server-side resources. All mutation goes through one
//! lock. Ids come from a single monotonic counter starting at 1 and are
//! never reused, so a released id stays invalid forever.
//!
//! Tuple deconstruction makes element handles that alias their parent's
//! storage. Storage is therefore reference counted per block rather than
//! per handle, and a parent cannot be released while derived handles are
//! live.

use devcomp_ir::Shape;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::buffer::DeviceBuffer;
use crate::compile::Executable;
use crate::error::{ServiceError, ServiceResult};
use crate::feed::Channel;
use crate::handle::{ChannelHandle, ChannelKind, DeviceHandle, ExecutionHandle, GlobalDataHandle};
use crate::platform::{Device, DeviceMemory};

/// A resolved data handle.
#[derive(Debug, Clone)]
pub struct ResolvedData {
    pub handle: GlobalDataHandle,
    pub buffer: Arc<DeviceBuffer>,
    pub shape: Shape,
    pub device: Arc<Device>,
}

#[derive(Debug)]
struct DataEntry {
    buffer: Arc<DeviceBuffer>,
    shape: Shape,
    device: Arc<Device>,
    block: u64,
    parent: Option<u64>,
    live_children: usize,
}

#[derive(Debug)]
struct StorageBlock {
    device: Arc<Device>,
    bytes: usize,
    refs: usize,
}

#[derive(Debug)]
enum Resource {
    Data(DataEntry),
    Executable(Arc<Executable>),
    Device(Arc<Device>),
    Channel(Arc<Channel>),
}

impl Resource {
    fn kind(&self) -> &'static str {
        match self {
            Resource::Data(_) => "data",
            Resource::Executable(_) => "an executable",
            Resource::Device(_) => "a device",
            Resource::Channel(_) => "a channel",
        }
    }
}

/// Live resource counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCounts {
    pub data: usize,
    pub executables: usize,
    pub devices: usize,
    pub channels: usize,
    pub storage_blocks: usize,
}

#[derive(Debug)]
struct RegistryState {
    next_id: u64,
    next_block: u64,
    entries: HashMap<u64, Resource>,
    blocks: HashMap<u64, StorageBlock>,
    devices: Vec<Arc<Device>>,
}

impl RegistryState {
    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn lookup(&self, id: u64, expected: &str) -> ServiceResult<&Resource> {
        self.entries.get(&id).ok_or_else(|| {
            ServiceError::invalid_handle(id, format!("no live {} with this id", expected))
        })
    }

    fn data(&self, id: u64) -> ServiceResult<&DataEntry> {
        match self.lookup(id, "data")? {
            Resource::Data(entry) => Ok(entry),
            other => Err(wrong_kind(id, other, "data")),
        }
    }

    fn release_block(&mut self, block: u64) {
        let Some(storage) = self.blocks.get_mut(&block) else {
            return;
        };
        storage.refs = storage.refs.saturating_sub(1);
        if storage.refs == 0 {
            if let Some(storage) = self.blocks.remove(&block) {
                storage.device.memory.release(storage.bytes);
            }
        }
    }

    fn release_data(&mut self, id: u64) -> ServiceResult<()> {
        let live_children = self.data(id)?.live_children;
        if live_children > 0 {
            return Err(ServiceError::invalid_handle(
                id,
                format!("{} element handles derived from it are still live", live_children),
            ));
        }
        let Some(Resource::Data(entry)) = self.entries.remove(&id) else {
            return Err(ServiceError::invalid_handle(id, "no live data with this id"));
        };
        if let Some(parent) = entry.parent {
            if let Some(Resource::Data(parent)) = self.entries.get_mut(&parent) {
                parent.live_children = parent.live_children.saturating_sub(1);
            }
        }
        self.release_block(entry.block);
        Ok(())
    }
}

fn wrong_kind(id: u64, found: &Resource, expected: &str) -> ServiceError {
    ServiceError::invalid_handle(id, format!("refers to {}, not {}", found.kind(), expected))
}

/// Registry of every live server-side resource.
#[derive(Debug)]
pub struct HandleRegistry {
    state: Mutex<RegistryState>,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                next_id: 1,
                next_block: 1,
                entries: HashMap::new(),
                blocks: HashMap::new(),
                devices: Vec::new(),
            }),
        }
    }

    /// Draw an id that is never handed out again, for resources tracked
    /// outside the registry such as execution tokens.
    pub fn reserve_id(&self) -> u64 {
        self.state.lock().allocate_id()
    }

    pub fn register_device(&self, ordinal: usize, platform: &str, capacity: usize) -> Arc<Device> {
        let mut state = self.state.lock();
        let id = state.allocate_id();
        let device = Arc::new(Device {
            handle: DeviceHandle(id),
            ordinal,
            platform: platform.to_string(),
            memory: DeviceMemory::new(capacity),
        });
        state.entries.insert(id, Resource::Device(Arc::clone(&device)));
        state.devices.push(Arc::clone(&device));
        state.devices.sort_by_key(|d| d.ordinal);
        device
    }

    /// Devices ordered by ordinal.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.state.lock().devices.clone()
    }

    pub fn resolve_device(&self, handle: DeviceHandle) -> ServiceResult<Arc<Device>> {
        let state = self.state.lock();
        match state.lookup(handle.0, "device")? {
            Resource::Device(device) => Ok(Arc::clone(device)),
            other => Err(wrong_kind(handle.0, other, "a device")),
        }
    }

    /// Register a buffer whose `bytes` have already been reserved on
    /// `device`. The registry returns them when the last reference goes.
    pub fn allocate_data(
        &self,
        buffer: Arc<DeviceBuffer>,
        shape: Shape,
        device: &Arc<Device>,
        bytes: usize,
    ) -> GlobalDataHandle {
        let mut state = self.state.lock();
        let block = state.next_block;
        state.next_block += 1;
        state.blocks.insert(
            block,
            StorageBlock {
                device: Arc::clone(device),
                bytes,
                refs: 1,
            },
        );
        let id = state.allocate_id();
        state.entries.insert(
            id,
            Resource::Data(DataEntry {
                buffer,
                shape,
                device: Arc::clone(device),
                block,
                parent: None,
                live_children: 0,
            }),
        );
        GlobalDataHandle(id)
    }

    pub fn resolve_data(&self, handle: GlobalDataHandle) -> ServiceResult<ResolvedData> {
        let state = self.state.lock();
        let entry = state.data(handle.0)?;
        Ok(ResolvedData {
            handle,
            buffer: Arc::clone(&entry.buffer),
            shape: entry.shape.clone(),
            device: Arc::clone(&entry.device),
        })
    }

    pub fn release_data(&self, handle: GlobalDataHandle) -> ServiceResult<()> {
        self.state.lock().release_data(handle.0)
    }

    /// Release several handles at once.
    ///
    /// Every handle is validated first; if any is invalid, or would leave
    /// live derived handles outside the set behind, nothing is released.
    pub fn release_data_many(&self, handles: &[GlobalDataHandle]) -> ServiceResult<()> {
        let mut state = self.state.lock();
        let targets: HashSet<u64> = handles.iter().map(|h| h.0).collect();
        if targets.len() != handles.len() {
            let mut seen = HashSet::new();
            if let Some(dup) = handles.iter().find(|h| !seen.insert(h.0)) {
                return Err(ServiceError::invalid_handle(dup.0, "listed more than once"));
            }
        }

        for handle in handles {
            let entry = state.data(handle.0)?;
            let released_children = handles
                .iter()
                .filter(|other| {
                    matches!(
                        state.entries.get(&other.0),
                        Some(Resource::Data(child)) if child.parent == Some(handle.0)
                    )
                })
                .count();
            let remaining = entry.live_children.saturating_sub(released_children);
            if remaining > 0 {
                return Err(ServiceError::invalid_handle(
                    handle.0,
                    format!("{} element handles derived from it are still live", remaining),
                ));
            }
        }

        // Children before parents.
        let mut pending: Vec<u64> = handles.iter().map(|h| h.0).collect();
        while !pending.is_empty() {
            let ready = pending
                .iter()
                .position(|id| matches!(state.data(*id), Ok(entry) if entry.live_children == 0));
            let Some(position) = ready else {
                return Err(ServiceError::invalid_handle(
                    pending[0],
                    "derived handles are still live",
                ));
            };
            let id = pending.swap_remove(position);
            state.release_data(id)?;
        }
        Ok(())
    }

    /// Create element handles aliasing the elements of a tuple.
    pub fn deconstruct(&self, handle: GlobalDataHandle) -> ServiceResult<Vec<GlobalDataHandle>> {
        let mut state = self.state.lock();
        let entry = state.data(handle.0)?;
        let (Some(elements), Some(shapes)) = (entry.buffer.elements(), entry.shape.tuple_elements())
        else {
            return Err(ServiceError::NotATuple(handle.0));
        };
        let children: Vec<(Arc<DeviceBuffer>, Shape)> = elements
            .iter()
            .cloned()
            .zip(shapes.iter().cloned())
            .collect();
        let device = Arc::clone(&entry.device);
        let block = entry.block;

        let mut handles = Vec::with_capacity(children.len());
        for (buffer, shape) in children {
            let id = state.allocate_id();
            state.entries.insert(
                id,
                Resource::Data(DataEntry {
                    buffer,
                    shape,
                    device: Arc::clone(&device),
                    block,
                    parent: Some(handle.0),
                    live_children: 0,
                }),
            );
            handles.push(GlobalDataHandle(id));
        }
        if let Some(storage) = state.blocks.get_mut(&block) {
            storage.refs += handles.len();
        }
        if let Some(Resource::Data(parent)) = state.entries.get_mut(&handle.0) {
            parent.live_children += handles.len();
        }
        Ok(handles)
    }

    /// Drop every data handle resident on `device` and free its storage.
    pub fn invalidate_device(&self, device: DeviceHandle) -> usize {
        let mut state = self.state.lock();
        let doomed: Vec<u64> = state
            .entries
            .iter()
            .filter_map(|(id, resource)| match resource {
                Resource::Data(entry) if entry.device.handle == device => Some(*id),
                _ => None,
            })
            .collect();
        for id in &doomed {
            state.entries.remove(id);
        }
        let blocks: Vec<u64> = state
            .blocks
            .iter()
            .filter(|(_, storage)| storage.device.handle == device)
            .map(|(block, _)| *block)
            .collect();
        for block in blocks {
            if let Some(storage) = state.blocks.remove(&block) {
                storage.device.memory.release(storage.bytes);
            }
        }
        doomed.len()
    }

    pub fn register_executable(&self, executable: Arc<Executable>) -> ExecutionHandle {
        let mut state = self.state.lock();
        let id = state.allocate_id();
        state.entries.insert(id, Resource::Executable(executable));
        ExecutionHandle(id)
    }

    pub fn resolve_executable(&self, handle: ExecutionHandle) -> ServiceResult<Arc<Executable>> {
        let state = self.state.lock();
        match state.lookup(handle.0, "executable")? {
            Resource::Executable(executable) => Ok(Arc::clone(executable)),
            other => Err(wrong_kind(handle.0, other, "an executable")),
        }
    }

    pub fn release_executable(&self, handle: ExecutionHandle) -> ServiceResult<()> {
        let mut state = self.state.lock();
        match state.lookup(handle.0, "executable")? {
            Resource::Executable(_) => {
                state.entries.remove(&handle.0);
                Ok(())
            }
            other => Err(wrong_kind(handle.0, other, "an executable")),
        }
    }

    pub fn create_channel(&self, kind: ChannelKind) -> Arc<Channel> {
        let mut state = self.state.lock();
        let id = state.allocate_id();
        let channel = Arc::new(Channel::new(ChannelHandle(id), kind));
        state
            .entries
            .insert(id, Resource::Channel(Arc::clone(&channel)));
        channel
    }

    pub fn resolve_channel(&self, handle: ChannelHandle) -> ServiceResult<Arc<Channel>> {
        let state = self.state.lock();
        match state.lookup(handle.0, "channel")? {
            Resource::Channel(channel) => Ok(Arc::clone(channel)),
            other => Err(wrong_kind(handle.0, other, "a channel")),
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.state.lock().entries.contains_key(&id)
    }

    pub fn live_data_count(&self) -> usize {
        self.counts().data
    }

    pub fn counts(&self) -> RegistryCounts {
        let state = self.state.lock();
        let mut counts = RegistryCounts {
            storage_blocks: state.blocks.len(),
            ..RegistryCounts::default()
        };
        for resource in state.entries.values() {
            match resource {
                Resource::Data(_) => counts.data += 1,
                Resource::Executable(_) => counts.executables += 1,
                Resource::Device(_) => counts.devices += 1,
                Resource::Channel(_) => counts.channels += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devcomp_ir::{ElementType, Literal};

    fn setup() -> (HandleRegistry, Arc<Device>) {
        let registry = HandleRegistry::new();
        let device = registry.register_device(0, "host", 1024);
        (registry, device)
    }

    fn store(registry: &HandleRegistry, device: &Arc<Device>, literal: Literal) -> GlobalDataHandle {
        let bytes = literal.to_le_bytes().len();
        assert!(device.memory.try_reserve(bytes));
        let shape = literal.shape();
        registry.allocate_data(DeviceBuffer::from_literal(literal), shape, device, bytes)
    }

    #[test]
    fn test_released_ids_are_not_reused() {
        let (registry, device) = setup();
        let first = store(&registry, &device, Literal::s32(1));
        registry.release_data(first).unwrap();
        let second = store(&registry, &device, Literal::s32(2));
        assert!(second.0 > first.0);
        assert!(matches!(
            registry.resolve_data(first),
            Err(ServiceError::InvalidHandle { .. })
        ));
        assert!(registry.release_data(first).is_err());
    }

    #[test]
    fn test_wrong_kind_is_invalid_handle() {
        let (registry, device) = setup();
        let err = registry
            .resolve_data(GlobalDataHandle(device.handle.0))
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidHandle { .. }));
        assert!(err.to_string().contains("a device"));
    }

    #[test]
    fn test_parent_release_blocked_by_children() {
        let (registry, device) = setup();
        let tuple = store(
            &registry,
            &device,
            Literal::tuple(vec![Literal::s32(1), Literal::s32(2)]),
        );
        let used = device.memory.used();
        let children = registry.deconstruct(tuple).unwrap();
        assert_eq!(children.len(), 2);
        assert!(registry.release_data(tuple).is_err());

        registry.release_data(children[0]).unwrap();
        assert!(registry.release_data(tuple).is_err());
        registry.release_data(children[1]).unwrap();
        registry.release_data(tuple).unwrap();
        assert_eq!(device.memory.used(), used - 8);
        assert_eq!(registry.counts().storage_blocks, 0);
    }

    #[test]
    fn test_storage_outlives_parent() {
        let (registry, device) = setup();
        let tuple = store(
            &registry,
            &device,
            Literal::tuple(vec![Literal::s32(1), Literal::s32(2)]),
        );
        let children = registry.deconstruct(tuple).unwrap();
        registry
            .release_data_many(&[tuple, children[0]])
            .unwrap_err();
        assert!(registry.contains(tuple.0));

        registry.release_data_many(&[tuple, children[0], children[1]]).unwrap();
        assert_eq!(registry.live_data_count(), 0);
        assert_eq!(device.memory.used(), 0);
    }

    #[test]
    fn test_release_many_is_atomic() {
        let (registry, device) = setup();
        let a = store(&registry, &device, Literal::s32(1));
        let err = registry
            .release_data_many(&[a, GlobalDataHandle(999)])
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidHandle { handle: 999, .. }));
        assert!(registry.resolve_data(a).is_ok());
        assert!(registry.release_data_many(&[a, a]).is_err());
    }

    #[test]
    fn test_deconstruct_array_fails() {
        let (registry, device) = setup();
        let array = store(&registry, &device, Literal::vector(ElementType::F32, &[1.0]));
        assert_eq!(
            registry.deconstruct(array).unwrap_err(),
            ServiceError::NotATuple(array.0)
        );
    }

    #[test]
    fn test_invalidate_device() {
        let registry = HandleRegistry::new();
        let d0 = registry.register_device(0, "host", 1024);
        let d1 = registry.register_device(1, "host", 1024);
        let a = store(&registry, &d0, Literal::s32(1));
        let tuple = store(&registry, &d0, Literal::tuple(vec![Literal::s32(2)]));
        registry.deconstruct(tuple).unwrap();
        let b = store(&registry, &d1, Literal::s32(3));

        assert_eq!(registry.invalidate_device(d0.handle), 3);
        assert!(registry.resolve_data(a).is_err());
        assert!(registry.resolve_data(b).is_ok());
        assert_eq!(d0.memory.used(), 0);
        assert_eq!(d1.memory.used(), 4);
    }

    #[test]
    fn test_devices_sorted_by_ordinal() {
        let registry = HandleRegistry::new();
        registry.register_device(1, "host", 0);
        registry.register_device(0, "host", 0);
        let ordinals: Vec<usize> = registry.devices().iter().map(|d| d.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1]);
        assert_eq!(registry.counts().devices, 2);
    }
}
