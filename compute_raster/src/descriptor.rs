// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Immutable groupings of bound resources.

use std::sync::Arc;

use crate::recording::{BindType, ResourceId, ResourceProxy};

/// One entry of a [`DescriptorTable`]. The binding index is the entry's position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Binding {
    pub ty: BindType,
    pub resource: ResourceProxy,
}

/// A bind group's worth of resources.
///
/// Tables are cheap to clone and never change after creation, so engines may cache whatever
/// they build from one under its [`id`](Self::id). Build a new table when a resource changes.
#[derive(Clone, Debug)]
pub struct DescriptorTable {
    id: ResourceId,
    label: &'static str,
    entries: Arc<[Binding]>,
}

impl DescriptorTable {
    pub fn new(label: &'static str, entries: impl IntoIterator<Item = Binding>) -> Self {
        Self {
            id: ResourceId::next(),
            label,
            entries: entries.into_iter().collect(),
        }
    }

    /// Starts a table whose entries are added in binding order.
    pub fn builder(label: &'static str) -> DescriptorTableBuilder {
        DescriptorTableBuilder {
            label,
            entries: Vec::new(),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn entries(&self) -> &[Binding] {
        &self.entries
    }

    /// The binding types, in binding order.
    pub fn layout(&self) -> impl Iterator<Item = BindType> + '_ {
        self.entries.iter().map(|b| b.ty)
    }

    pub fn matches_layout(&self, layout: &[BindType]) -> bool {
        self.layout().eq(layout.iter().copied())
    }

    /// Whether any entry refers to the resource `id`.
    pub fn references(&self, id: ResourceId) -> bool {
        self.entries.iter().any(|b| b.resource.id() == id)
    }
}

impl PartialEq for DescriptorTable {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DescriptorTable {}

pub struct DescriptorTableBuilder {
    label: &'static str,
    entries: Vec<Binding>,
}

impl DescriptorTableBuilder {
    pub fn bind(mut self, ty: BindType, resource: impl Into<ResourceProxy>) -> Self {
        self.entries.push(Binding {
            ty,
            resource: resource.into(),
        });
        self
    }

    pub fn uniform(self, resource: impl Into<ResourceProxy>) -> Self {
        self.bind(BindType::Uniform, resource)
    }

    pub fn read_only(self, resource: impl Into<ResourceProxy>) -> Self {
        self.bind(BindType::BufReadOnly, resource)
    }

    pub fn read_write(self, resource: impl Into<ResourceProxy>) -> Self {
        self.bind(BindType::Buffer, resource)
    }

    pub fn build(self) -> DescriptorTable {
        DescriptorTable::new(self.label, self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{BufferProxy, ImageFormat, ImageProxy};

    #[test]
    fn layout_and_references() {
        let uniform = BufferProxy::new(16, "uniform");
        let list = BufferProxy::new(64, "list");
        let image = ImageProxy::new(8, 8, ImageFormat::Rgba8, "target");
        let table = DescriptorTable::builder("stage")
            .uniform(uniform)
            .read_write(list)
            .bind(BindType::Image(ImageFormat::Rgba8), image)
            .build();
        assert!(table.matches_layout(&[
            BindType::Uniform,
            BindType::Buffer,
            BindType::Image(ImageFormat::Rgba8)
        ]));
        assert!(!table.matches_layout(&[BindType::Uniform, BindType::Buffer]));
        assert!(table.references(image.id));
        assert!(!table.references(BufferProxy::new(4, "other").id));
    }

    #[test]
    fn clones_share_identity() {
        let table = DescriptorTable::builder("t")
            .read_only(BufferProxy::new(4, "b"))
            .build();
        let same = table.clone();
        let rebuilt = DescriptorTable::new("t", table.entries().iter().copied());
        assert_eq!(table, same);
        assert_ne!(table, rebuilt);
    }
}
