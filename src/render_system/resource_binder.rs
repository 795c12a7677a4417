//! Binding of logical resources into the fixed resource sets of every pipeline stage.
//!
//! Each stage declares its sets up front. Sets are written once at setup; only the sets that
//! reference size-dependent buffers are written again after a resize. Writing a set with the
//! same resources it already holds is a no-op.

use std::collections::HashMap;

use crate::error::RenderError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    RayTrace,
    Exposure,
    PostProcess,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceSetKind {
    AccelerationStructure,
    SceneUniforms,
    /// vertex, index and instance buffers
    Geometry,
    /// material table, sampler and texture array
    Materials,
    Lights,
    /// accumulation and denoiser buffers written by the ray trace stage
    RenderTargets,
    /// accumulation, denoised output, exposure and display buffers of the compute passes
    PostProcessTargets,
}

impl ResourceSetKind {
    /// Sets that reference buffers recreated on resize.
    pub fn is_size_dependent(self) -> bool {
        matches!(
            self,
            ResourceSetKind::RenderTargets | ResourceSetKind::PostProcessTargets
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindingDeclaration {
    pub binding: u32,
    /// number of descriptors, the array length for arrays
    pub count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetDeclaration {
    pub set: u32,
    pub kind: ResourceSetKind,
    pub bindings: Vec<BindingDeclaration>,
}

impl SetDeclaration {
    /// A set where every binding holds a single descriptor.
    pub fn single(set: u32, kind: ResourceSetKind, bindings: u32) -> SetDeclaration {
        SetDeclaration {
            set,
            kind,
            bindings: (0..bindings)
                .map(|binding| BindingDeclaration { binding, count: 1 })
                .collect(),
        }
    }

    pub fn with_array(mut self, binding: u32, count: u32) -> SetDeclaration {
        match self.bindings.iter_mut().find(|b| b.binding == binding) {
            Some(b) => b.count = count,
            None => self.bindings.push(BindingDeclaration { binding, count }),
        }
        self
    }
}

#[derive(Clone, Debug)]
pub struct StageLayout {
    pub stage: PipelineStage,
    pub sets: Vec<SetDeclaration>,
}

/// Stable identity of a bound resource: two resources with the same identity are the same
/// device object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceId(pub u64);

pub trait BoundResource {
    fn identity(&self) -> ResourceId;
}

/// Resources written to one binding of a set.
#[derive(Clone, Debug)]
pub struct ResourceBinding<R> {
    pub binding: u32,
    pub resources: Vec<R>,
}

impl<R> ResourceBinding<R> {
    pub fn one(binding: u32, resource: R) -> ResourceBinding<R> {
        ResourceBinding {
            binding,
            resources: vec![resource],
        }
    }

    pub fn array(binding: u32, resources: Vec<R>) -> ResourceBinding<R> {
        ResourceBinding { binding, resources }
    }
}

/// Creates the device-side object of a set once its contents were validated.
pub trait SetWriter {
    type Resource: BoundResource;
    type Set;

    fn write_set(
        &mut self,
        stage: PipelineStage,
        declaration: &SetDeclaration,
        bindings: &[ResourceBinding<Self::Resource>],
    ) -> Result<Self::Set, RenderError>;
}

struct BoundSet<S> {
    identities: Vec<(u32, Vec<ResourceId>)>,
    set: S,
}

pub struct ResourceBinder<W: SetWriter> {
    writer: W,
    layouts: HashMap<PipelineStage, StageLayout>,
    bound: HashMap<(PipelineStage, u32), BoundSet<W::Set>>,
}

impl<W: SetWriter> ResourceBinder<W> {
    pub fn new(writer: W, layouts: impl IntoIterator<Item = StageLayout>) -> ResourceBinder<W> {
        ResourceBinder {
            writer,
            layouts: layouts.into_iter().map(|l| (l.stage, l)).collect(),
            bound: HashMap::new(),
        }
    }

    pub fn declaration(&self, stage: PipelineStage, set: u32) -> Result<&SetDeclaration, RenderError> {
        self.layouts
            .get(&stage)
            .and_then(|l| l.sets.iter().find(|s| s.set == set))
            .ok_or(RenderError::UnknownResourceSet { stage, set })
    }

    /// Writes `bindings` into set `set` of `stage`. Returns whether the set was (re)written.
    pub fn bind_set(
        &mut self,
        stage: PipelineStage,
        set: u32,
        bindings: Vec<ResourceBinding<W::Resource>>,
    ) -> Result<bool, RenderError> {
        let declaration = self.declaration(stage, set)?.clone();
        validate(stage, &declaration, &bindings)?;

        let mut identities: Vec<(u32, Vec<ResourceId>)> = bindings
            .iter()
            .map(|b| (b.binding, b.resources.iter().map(|r| r.identity()).collect()))
            .collect();
        identities.sort_by_key(|(binding, _)| *binding);

        if let Some(bound) = self.bound.get(&(stage, set)) {
            if bound.identities == identities {
                return Ok(false);
            }
            log::debug!("rebinding {stage:?} set {set} ({:?})", declaration.kind);
        }

        let written = self.writer.write_set(stage, &declaration, &bindings)?;
        self.bound.insert(
            (stage, set),
            BoundSet {
                identities,
                set: written,
            },
        );
        Ok(true)
    }

    /// Rebinds every size-dependent set with the resources `resources` returns for it.
    pub fn rebind_size_dependent(
        &mut self,
        mut resources: impl FnMut(
            PipelineStage,
            &SetDeclaration,
        ) -> Result<Vec<ResourceBinding<W::Resource>>, RenderError>,
    ) -> Result<usize, RenderError> {
        let mut targets: Vec<(PipelineStage, SetDeclaration)> = self
            .layouts
            .values()
            .flat_map(|l| {
                l.sets
                    .iter()
                    .filter(|s| s.kind.is_size_dependent())
                    .map(|s| (l.stage, s.clone()))
            })
            .collect();
        targets.sort_by_key(|(stage, s)| (*stage as u8, s.set));

        let mut rewritten = 0;
        for (stage, declaration) in targets {
            let bindings = resources(stage, &declaration)?;
            if self.bind_set(stage, declaration.set, bindings)? {
                rewritten += 1;
            }
        }
        Ok(rewritten)
    }

    pub fn set(&self, stage: PipelineStage, set: u32) -> Option<&W::Set> {
        self.bound.get(&(stage, set)).map(|b| &b.set)
    }

    /// Bound sets of `stage` ordered by set index.
    pub fn sets(&self, stage: PipelineStage) -> Vec<&W::Set> {
        let mut sets: Vec<(u32, &W::Set)> = self
            .bound
            .iter()
            .filter(|((s, _), _)| *s == stage)
            .map(|((_, index), b)| (*index, &b.set))
            .collect();
        sets.sort_by_key(|(index, _)| *index);
        sets.into_iter().map(|(_, s)| s).collect()
    }

    /// True when every declared set of `stage` has been written.
    pub fn is_complete(&self, stage: PipelineStage) -> bool {
        self.layouts.get(&stage).is_some_and(|l| {
            l.sets
                .iter()
                .all(|s| self.bound.contains_key(&(stage, s.set)))
        })
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }
}

fn validate<R>(
    stage: PipelineStage,
    declaration: &SetDeclaration,
    bindings: &[ResourceBinding<R>],
) -> Result<(), RenderError> {
    let mismatch = |binding: u32, expected: u32, actual: u32| RenderError::BindingMismatch {
        stage,
        set: declaration.set,
        kind: declaration.kind,
        binding,
        expected,
        actual,
    };

    for declared in &declaration.bindings {
        let actual = bindings
            .iter()
            .filter(|b| b.binding == declared.binding)
            .map(|b| b.resources.len() as u32)
            .sum::<u32>();
        if actual != declared.count {
            return Err(mismatch(declared.binding, declared.count, actual));
        }
    }
    for provided in bindings {
        if !declaration.bindings.iter().any(|d| d.binding == provided.binding) {
            return Err(mismatch(
                provided.binding,
                0,
                provided.resources.len() as u32,
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug)]
    struct Res(u64);

    impl BoundResource for Res {
        fn identity(&self) -> ResourceId {
            ResourceId(self.0)
        }
    }

    #[derive(Default)]
    struct CountingWriter {
        writes: Vec<(PipelineStage, u32)>,
    }

    impl SetWriter for CountingWriter {
        type Resource = Res;
        type Set = Vec<u64>;

        fn write_set(
            &mut self,
            stage: PipelineStage,
            declaration: &SetDeclaration,
            bindings: &[ResourceBinding<Res>],
        ) -> Result<Vec<u64>, RenderError> {
            self.writes.push((stage, declaration.set));
            Ok(bindings
                .iter()
                .flat_map(|b| b.resources.iter().map(|r| r.0))
                .collect())
        }
    }

    fn binder() -> ResourceBinder<CountingWriter> {
        ResourceBinder::new(
            CountingWriter::default(),
            [StageLayout {
                stage: PipelineStage::RayTrace,
                sets: vec![
                    SetDeclaration::single(0, ResourceSetKind::AccelerationStructure, 1),
                    SetDeclaration::single(3, ResourceSetKind::Materials, 2).with_array(2, 3),
                    SetDeclaration::single(5, ResourceSetKind::RenderTargets, 2),
                ],
            }],
        )
    }

    fn materials(textures: u64) -> Vec<ResourceBinding<Res>> {
        vec![
            ResourceBinding::one(0, Res(10)),
            ResourceBinding::one(1, Res(11)),
            ResourceBinding::array(2, (0..textures).map(|i| Res(100 + i)).collect()),
        ]
    }

    #[test]
    fn binding_same_resources_twice_is_a_noop() {
        let mut binder = binder();
        assert!(binder.bind_set(PipelineStage::RayTrace, 0, vec![ResourceBinding::one(0, Res(1))]).unwrap());
        assert!(!binder.bind_set(PipelineStage::RayTrace, 0, vec![ResourceBinding::one(0, Res(1))]).unwrap());
        assert_eq!(binder.writer().writes.len(), 1);
    }

    #[test]
    fn texture_array_length_must_match_capacity() {
        let mut binder = binder();
        assert!(binder.bind_set(PipelineStage::RayTrace, 3, materials(3)).unwrap());
        let err = binder
            .bind_set(PipelineStage::RayTrace, 3, materials(2))
            .unwrap_err();
        assert!(matches!(
            err,
            RenderError::BindingMismatch {
                binding: 2,
                expected: 3,
                actual: 2,
                kind: ResourceSetKind::Materials,
                ..
            }
        ));
    }

    #[test]
    fn undeclared_binding_or_set_is_fatal() {
        let mut binder = binder();
        let extra = vec![ResourceBinding::one(0, Res(1)), ResourceBinding::one(1, Res(2))];
        assert!(binder.bind_set(PipelineStage::RayTrace, 0, extra).is_err());
        assert!(matches!(
            binder.bind_set(PipelineStage::RayTrace, 4, vec![]),
            Err(RenderError::UnknownResourceSet { set: 4, .. })
        ));
        assert!(binder.bind_set(PipelineStage::PostProcess, 0, vec![]).is_err());
    }

    #[test]
    fn resize_only_rewrites_size_dependent_sets() {
        let mut binder = binder();
        binder
            .bind_set(PipelineStage::RayTrace, 0, vec![ResourceBinding::one(0, Res(1))])
            .unwrap();
        binder
            .bind_set(PipelineStage::RayTrace, 3, materials(3))
            .unwrap();
        binder
            .bind_set(
                PipelineStage::RayTrace,
                5,
                vec![ResourceBinding::one(0, Res(50)), ResourceBinding::one(1, Res(51))],
            )
            .unwrap();
        assert!(binder.is_complete(PipelineStage::RayTrace));

        let rewritten = binder
            .rebind_size_dependent(|stage, declaration| {
                assert_eq!(stage, PipelineStage::RayTrace);
                assert_eq!(declaration.kind, ResourceSetKind::RenderTargets);
                Ok(vec![
                    ResourceBinding::one(0, Res(60)),
                    ResourceBinding::one(1, Res(61)),
                ])
            })
            .unwrap();
        assert_eq!(rewritten, 1);
        assert_eq!(binder.writer().writes.len(), 4);
        assert_eq!(binder.set(PipelineStage::RayTrace, 5), Some(&vec![60, 61]));
        assert_eq!(binder.sets(PipelineStage::RayTrace).len(), 3);
    }
}
