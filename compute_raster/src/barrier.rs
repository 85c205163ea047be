// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Resource state tracking and barrier batching.
//!
//! Every resource starts in [`ResourceState::Common`]. Before a command uses a resource the
//! recorder transitions it into the state that use needs; [`BarrierBatch`] collects those
//! transitions so each stage boundary costs a single [`Command::Barrier`].
//!
//! Writes through read/write bindings leave the resource with *pending writes*. A later command
//! may only touch it after a barrier: either a transition out of the state, or an unordered
//! access barrier when it stays in [`ResourceState::UnorderedAccess`].
//!
//! [`Command::Barrier`]: crate::Command::Barrier

use std::collections::HashMap;
use std::fmt;

use smallvec::SmallVec;

use crate::descriptor::DescriptorTable;
use crate::recording::{BindType, Recording, ResourceId, ResourceProxy};

/// The way a resource is about to be used.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Freshly created, uploaded or written by the host.
    #[default]
    Common,
    CopySource,
    CopyDest,
    /// Read/write storage access from a dispatch.
    UnorderedAccess,
    /// Read only access from a dispatch.
    ShaderResource,
    /// Consumed as the arguments of an indirect dispatch.
    IndirectArgument,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Common => "common",
            Self::CopySource => "copy source",
            Self::CopyDest => "copy destination",
            Self::UnorderedAccess => "unordered access",
            Self::ShaderResource => "shader resource",
            Self::IndirectArgument => "indirect argument",
        };
        f.write_str(name)
    }
}

impl ResourceState {
    /// The state a binding of type `ty` needs, or `None` for untracked bindings.
    pub fn for_binding(ty: BindType) -> Option<Self> {
        match ty {
            BindType::Buffer | BindType::Image(_) => Some(Self::UnorderedAccess),
            BindType::BufReadOnly | BindType::ImageRead(_) => Some(Self::ShaderResource),
            BindType::Uniform => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Barrier {
    Transition {
        resource: ResourceProxy,
        before: ResourceState,
        after: ResourceState,
    },
    /// Orders unordered accesses to a resource that stays in unordered access.
    Uav(ResourceProxy),
}

impl Barrier {
    pub fn resource(&self) -> &ResourceProxy {
        match self {
            Self::Transition { resource, .. } | Self::Uav(resource) => resource,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Tracked {
    state: ResourceState,
    pending_writes: bool,
}

/// Recorder-side view of every resource's state.
#[derive(Debug, Default)]
pub struct ResourceStates {
    resources: HashMap<ResourceId, Tracked>,
}

impl ResourceStates {
    pub fn state(&self, id: ResourceId) -> ResourceState {
        self.resources.get(&id).map(|t| t.state).unwrap_or_default()
    }

    pub fn has_pending_writes(&self, id: ResourceId) -> bool {
        self.resources.get(&id).is_some_and(|t| t.pending_writes)
    }

    /// Number of resources with a known state.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn batch(&mut self) -> BarrierBatch<'_> {
        BarrierBatch {
            states: self,
            barriers: SmallVec::new(),
        }
    }

    /// Records that a command wrote `resource` through unordered access.
    pub fn mark_written(&mut self, resource: impl Into<ResourceProxy>) {
        let id = resource.into().id();
        self.resources.entry(id).or_default().pending_writes = true;
    }

    /// Marks every read/write binding of `tables` as written by a dispatch.
    pub fn mark_dispatch(&mut self, tables: &[DescriptorTable]) {
        for binding in tables.iter().flat_map(|t| t.entries()) {
            if binding.ty.is_writable() {
                self.mark_written(binding.resource);
            }
        }
    }

    /// Stops tracking a freed resource.
    pub fn forget(&mut self, id: ResourceId) {
        self.resources.remove(&id);
    }
}

/// Barriers collected for one stage boundary.
#[must_use = "a batch does nothing until it is submitted"]
pub struct BarrierBatch<'a> {
    states: &'a mut ResourceStates,
    barriers: SmallVec<[Barrier; 8]>,
}

impl BarrierBatch<'_> {
    /// Moves `resource` into `after`.
    ///
    /// Emits a transition when the state changes, and an unordered access barrier when the
    /// resource stays in unordered access with pending writes. Otherwise nothing is emitted.
    pub fn transition(&mut self, resource: impl Into<ResourceProxy>, after: ResourceState) -> &mut Self {
        let resource = resource.into();
        let tracked = self.states.resources.entry(resource.id()).or_default();
        if tracked.state != after {
            self.barriers.push(Barrier::Transition {
                resource,
                before: tracked.state,
                after,
            });
            tracked.state = after;
            tracked.pending_writes = false;
        } else if after == ResourceState::UnorderedAccess && tracked.pending_writes {
            self.barriers.push(Barrier::Uav(resource));
            tracked.pending_writes = false;
        }
        self
    }

    /// Transitions every tracked binding of `table` into the state its binding type needs.
    pub fn bind_table(&mut self, table: &DescriptorTable) -> &mut Self {
        for binding in table.entries() {
            if let Some(state) = ResourceState::for_binding(binding.ty) {
                self.transition(binding.resource, state);
            }
        }
        self
    }

    /// Orders earlier unordered writes to `resource` before later accesses.
    pub fn uav(&mut self, resource: impl Into<ResourceProxy>) -> &mut Self {
        let resource = resource.into();
        if let Some(tracked) = self.states.resources.get_mut(&resource.id())
            && tracked.pending_writes
        {
            self.barriers.push(Barrier::Uav(resource));
            tracked.pending_writes = false;
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.barriers.is_empty()
    }

    /// Records the collected barriers as one command.
    pub fn submit(self, recording: &mut Recording) {
        if self.barriers.is_empty() {
            return;
        }
        log::trace!(
            "barrier batch: {}",
            self.barriers
                .iter()
                .map(|b| match b {
                    Barrier::Transition {
                        resource,
                        before,
                        after,
                    } => format!("{} {before} -> {after}", resource.name()),
                    Barrier::Uav(resource) => format!("{} uav", resource.name()),
                })
                .collect::<Vec<_>>()
                .join(", ")
        );
        recording.barrier(self.barriers);
    }
}
