//! Shader binding table construction.
//!
//! The table is a byte image holding one program handle per shader group, in the fixed order of
//! [`ShaderGroup::ALL`]. Group `i` lives at `i * align_up(handle_size, handle_alignment)`. When
//! the table is uploaded, the ray generation, miss and hit regions additionally have to start at
//! `base_alignment`-aligned addresses, which [`ShaderBindingTable::device_layout`] takes care of.

use serde::{Deserialize, Serialize};

use crate::error::RenderError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShaderGroup {
    RayGen,
    Miss,
    ShadowMiss,
    /// closest hit + any hit
    Hit,
    /// any hit only
    ShadowHit,
}

impl ShaderGroup {
    pub const ALL: [ShaderGroup; 5] = [
        ShaderGroup::RayGen,
        ShaderGroup::Miss,
        ShaderGroup::ShadowMiss,
        ShaderGroup::Hit,
        ShaderGroup::ShadowHit,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn region(self) -> Region {
        match self {
            ShaderGroup::RayGen => Region::RayGen,
            ShaderGroup::Miss | ShaderGroup::ShadowMiss => Region::Miss,
            ShaderGroup::Hit | ShaderGroup::ShadowHit => Region::Hit,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Region {
    RayGen,
    Miss,
    Hit,
}

/// Rounds `x` up to the next multiple of `a` (`a > 0`).
pub fn align_up(x: u32, a: u32) -> u32 {
    x.div_ceil(a) * a
}

/// Device limits governing the table layout, queried once per device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandleProperties {
    pub handle_size: u32,
    pub handle_alignment: u32,
    pub base_alignment: u32,
}

impl HandleProperties {
    pub fn validate(&self) -> Result<(), RenderError> {
        if self.handle_size == 0 || self.handle_alignment == 0 || self.base_alignment == 0 {
            return Err(RenderError::ShaderBindingTable(format!(
                "device reported zero handle size or alignment: {self:?}"
            )));
        }
        Ok(())
    }

    /// Distance between two consecutive handles.
    pub fn stride(&self) -> u32 {
        align_up(self.handle_size, self.handle_alignment)
    }
}

/// Something that can report the program handles of a compiled pipeline.
pub trait GroupHandleSource {
    fn handle_properties(&self) -> HandleProperties;

    /// Returns `count * handle_size` bytes, the handles of groups `0..count` packed tightly.
    fn group_handles(&self, count: u32) -> Result<Vec<u8>, RenderError>;
}

/// Turns the packed handles into a table. Injected into [`ShaderBindingTableBuilder`].
pub type BuildStrategy =
    fn(&HandleProperties, &[ShaderGroup], &[u8]) -> Result<ShaderBindingTable, RenderError>;

#[derive(Clone, Debug)]
pub struct ShaderBindingTable {
    properties: HandleProperties,
    groups: Vec<ShaderGroup>,
    data: Vec<u8>,
}

/// Where one region lives in the uploaded table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionPlacement {
    pub offset: u64,
    pub stride: u64,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceLayout {
    pub raygen: RegionPlacement,
    pub miss: RegionPlacement,
    pub hit: RegionPlacement,
    pub bytes: Vec<u8>,
}

impl ShaderBindingTable {
    pub fn properties(&self) -> &HandleProperties {
        &self.properties
    }

    pub fn groups(&self) -> &[ShaderGroup] {
        &self.groups
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn offset(&self, index: usize) -> usize {
        index * self.properties.stride() as usize
    }

    pub fn handle(&self, group: ShaderGroup) -> &[u8] {
        let start = self.offset(group.index());
        &self.data[start..start + self.properties.handle_size as usize]
    }

    /// Lays the table out for `vkCmdTraceRaysKHR`: every region starts on a base-aligned
    /// offset, handles inside a region keep the aligned handle stride.
    pub fn device_layout(&self) -> DeviceLayout {
        let stride = self.properties.stride() as u64;
        let base = self.properties.base_alignment;

        let count = |region: Region| {
            self.groups.iter().filter(|g| g.region() == region).count() as u64
        };
        let region_size = |n: u64| align_up((n * stride) as u32, base) as u64;

        // the raygen region must have size == stride
        let raygen_stride = align_up(stride as u32, base) as u64;
        let raygen = RegionPlacement {
            offset: 0,
            stride: raygen_stride,
            size: raygen_stride,
        };
        let miss = RegionPlacement {
            offset: raygen.offset + raygen.size,
            stride,
            size: region_size(count(Region::Miss)),
        };
        let hit = RegionPlacement {
            offset: miss.offset + miss.size,
            stride,
            size: region_size(count(Region::Hit)),
        };

        let mut bytes = vec![0u8; (hit.offset + hit.size) as usize];
        let handle_size = self.properties.handle_size as usize;
        let mut next = [raygen.offset, miss.offset, hit.offset];
        for &group in &self.groups {
            let (slot, step) = match group.region() {
                Region::RayGen => (0, raygen.stride),
                Region::Miss => (1, miss.stride),
                Region::Hit => (2, hit.stride),
            };
            let dst = next[slot] as usize;
            bytes[dst..dst + handle_size].copy_from_slice(self.handle(group));
            next[slot] += step;
        }

        DeviceLayout {
            raygen,
            miss,
            hit,
            bytes,
        }
    }
}

/// Default strategy: one contiguous table, handle `i` at `i * stride`.
pub fn aligned_contiguous(
    properties: &HandleProperties,
    groups: &[ShaderGroup],
    handles: &[u8],
) -> Result<ShaderBindingTable, RenderError> {
    let handle_size = properties.handle_size as usize;
    let stride = properties.stride() as usize;

    let mut data = vec![0u8; groups.len() * stride];
    for (i, chunk) in handles.chunks_exact(handle_size).enumerate() {
        data[i * stride..i * stride + handle_size].copy_from_slice(chunk);
    }

    Ok(ShaderBindingTable {
        properties: *properties,
        groups: groups.to_vec(),
        data,
    })
}

pub struct ShaderBindingTableBuilder {
    layout: Vec<ShaderGroup>,
    strategy: BuildStrategy,
}

impl ShaderBindingTableBuilder {
    /// Fails unless `layout` is exactly the fixed group enumeration; any other order would make
    /// the device run the wrong program for a ray.
    pub fn new(layout: &[ShaderGroup]) -> Result<ShaderBindingTableBuilder, RenderError> {
        if layout != ShaderGroup::ALL {
            return Err(RenderError::ShaderBindingTable(format!(
                "group layout {layout:?} does not match {:?}",
                ShaderGroup::ALL
            )));
        }
        Ok(ShaderBindingTableBuilder {
            layout: layout.to_vec(),
            strategy: aligned_contiguous,
        })
    }

    pub fn with_strategy(mut self, strategy: BuildStrategy) -> ShaderBindingTableBuilder {
        self.strategy = strategy;
        self
    }

    pub fn build(&self, source: &impl GroupHandleSource) -> Result<ShaderBindingTable, RenderError> {
        let properties = source.handle_properties();
        properties.validate()?;

        let handles = source.group_handles(self.layout.len() as u32)?;
        let expected = self.layout.len() * properties.handle_size as usize;
        if handles.len() != expected {
            return Err(RenderError::ShaderBindingTable(format!(
                "expected {expected} bytes of group handles, got {}",
                handles.len()
            )));
        }

        let table = (self.strategy)(&properties, &self.layout, &handles)?;
        if table.groups() != self.layout.as_slice() {
            return Err(RenderError::ShaderBindingTable(
                "build strategy reordered the shader groups".to_string(),
            ));
        }
        log::debug!(
            "built shader binding table: {} groups, stride {}",
            table.groups().len(),
            properties.stride()
        );
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakePipeline {
        properties: HandleProperties,
    }

    impl GroupHandleSource for FakePipeline {
        fn handle_properties(&self) -> HandleProperties {
            self.properties
        }

        // handle i is filled with the byte i + 1
        fn group_handles(&self, count: u32) -> Result<Vec<u8>, RenderError> {
            let size = self.properties.handle_size as usize;
            Ok((0..count as usize)
                .flat_map(|i| std::iter::repeat_n(i as u8 + 1, size))
                .collect())
        }
    }

    fn nvidia_like() -> HandleProperties {
        HandleProperties {
            handle_size: 32,
            handle_alignment: 32,
            base_alignment: 64,
        }
    }

    #[test]
    fn align_up_rounds_to_multiple() {
        for a in [1u32, 2, 4, 8, 16, 32, 64] {
            for x in 0..130 {
                let y = align_up(x, a);
                assert!(y >= x);
                assert_eq!(y % a, 0);
                assert!(y - x < a);
            }
        }
    }

    #[test]
    fn offsets_follow_aligned_handle_size() {
        let properties = HandleProperties {
            handle_size: 20,
            handle_alignment: 16,
            base_alignment: 64,
        };
        let table = ShaderBindingTableBuilder::new(&ShaderGroup::ALL)
            .unwrap()
            .build(&FakePipeline { properties })
            .unwrap();
        for i in 0..5 {
            assert_eq!(table.offset(i), i * align_up(20, 16) as usize);
        }
        assert_eq!(table.data().len(), 5 * 32);
    }

    #[test]
    fn handles_land_in_their_slots() {
        let table = ShaderBindingTableBuilder::new(&ShaderGroup::ALL)
            .unwrap()
            .build(&FakePipeline {
                properties: nvidia_like(),
            })
            .unwrap();
        for group in ShaderGroup::ALL {
            assert!(table.handle(group).iter().all(|&b| b == group.index() as u8 + 1));
        }
    }

    #[test]
    fn zero_sizes_are_fatal() {
        let builder = ShaderBindingTableBuilder::new(&ShaderGroup::ALL).unwrap();
        let zero_size = FakePipeline {
            properties: HandleProperties {
                handle_size: 0,
                ..nvidia_like()
            },
        };
        assert!(matches!(
            builder.build(&zero_size),
            Err(RenderError::ShaderBindingTable(_))
        ));
        let zero_alignment = FakePipeline {
            properties: HandleProperties {
                handle_alignment: 0,
                ..nvidia_like()
            },
        };
        assert!(builder.build(&zero_alignment).is_err());
    }

    #[test]
    fn wrong_group_order_is_rejected() {
        let mut layout = ShaderGroup::ALL.to_vec();
        layout.swap(1, 2);
        assert!(ShaderBindingTableBuilder::new(&layout).is_err());
        assert!(ShaderBindingTableBuilder::new(&ShaderGroup::ALL[..4]).is_err());
    }

    #[test]
    fn short_handle_blob_is_rejected() {
        struct Truncated;
        impl GroupHandleSource for Truncated {
            fn handle_properties(&self) -> HandleProperties {
                nvidia_like()
            }
            fn group_handles(&self, _count: u32) -> Result<Vec<u8>, RenderError> {
                Ok(vec![0; 32 * 4])
            }
        }
        let builder = ShaderBindingTableBuilder::new(&ShaderGroup::ALL).unwrap();
        assert!(builder.build(&Truncated).is_err());
    }

    #[test]
    fn injected_strategy_is_used() {
        fn reversed(
            properties: &HandleProperties,
            groups: &[ShaderGroup],
            handles: &[u8],
        ) -> Result<ShaderBindingTable, RenderError> {
            let mut table = aligned_contiguous(properties, groups, handles)?;
            table.groups.reverse();
            Ok(table)
        }
        let builder = ShaderBindingTableBuilder::new(&ShaderGroup::ALL)
            .unwrap()
            .with_strategy(reversed);
        let result = builder.build(&FakePipeline {
            properties: nvidia_like(),
        });
        assert!(matches!(result, Err(RenderError::ShaderBindingTable(_))));
    }

    #[test]
    fn device_regions_are_base_aligned() {
        let properties = HandleProperties {
            handle_size: 32,
            handle_alignment: 32,
            base_alignment: 64,
        };
        let table = ShaderBindingTableBuilder::new(&ShaderGroup::ALL)
            .unwrap()
            .build(&FakePipeline { properties })
            .unwrap();
        let layout = table.device_layout();

        for region in [layout.raygen, layout.miss, layout.hit] {
            assert_eq!(region.offset % 64, 0);
            assert_eq!(region.size % 64, 0);
        }
        assert_eq!(layout.raygen.size, layout.raygen.stride);
        assert_eq!(layout.miss.stride, 32);

        // second miss handle sits one stride after the first
        let shadow_miss = (layout.miss.offset + layout.miss.stride) as usize;
        assert!(layout.bytes[shadow_miss..shadow_miss + 32].iter().all(|&b| b == 3));
        let shadow_hit = (layout.hit.offset + layout.hit.stride) as usize;
        assert!(layout.bytes[shadow_hit..shadow_hit + 32].iter().all(|&b| b == 5));
    }
}
