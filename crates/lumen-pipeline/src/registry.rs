//! Lookup from operation names to stage constructors.

use std::collections::HashMap;

use crate::stage::Stage;
use crate::stages;

/// Builds a fresh stage instance.
pub type StageFactory = fn() -> Box<dyn Stage>;

/// Everything needed to instantiate a stage by name.
#[derive(Debug, Clone, Copy)]
pub struct StageDescriptor {
    /// Operation name.
    pub op: &'static str,
    /// Constructor.
    pub factory: StageFactory,
}

impl StageDescriptor {
    /// Describe a stage type constructible with `Default`.
    #[must_use]
    pub fn of<S: Stage + Default + 'static>(op: &'static str) -> Self {
        Self {
            op,
            factory: make::<S>,
        }
    }
}

fn make<S: Stage + Default + 'static>() -> Box<dyn Stage> {
    Box::new(S::default())
}

/// The set of stages a pipeline can instantiate.
#[derive(Debug, Clone, Default)]
pub struct StageRegistry {
    descriptors: HashMap<&'static str, StageDescriptor>,
}

impl StageRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every builtin stage.
    #[must_use]
    pub fn with_builtin_stages() -> Self {
        let mut registry = Self::new();
        registry.register(StageDescriptor::of::<stages::crop::Crop>(stages::crop::OP));
        registry.register(StageDescriptor::of::<stages::exposure::Exposure>(stages::exposure::OP));
        registry.register(StageDescriptor::of::<stages::levels::Levels>(stages::levels::OP));
        registry.register(StageDescriptor::of::<stages::tonecurve::Tonecurve>(stages::tonecurve::OP));
        registry.register(StageDescriptor::of::<stages::lowpass::Lowpass>(stages::lowpass::OP));
        registry.register(StageDescriptor::of::<stages::colorout::Colorout>(stages::colorout::OP));
        registry.register(StageDescriptor::of::<stages::gamma::Gamma>(stages::gamma::OP));
        registry
    }

    /// Add or replace a stage.
    pub fn register(&mut self, descriptor: StageDescriptor) {
        self.descriptors.insert(descriptor.op, descriptor);
    }

    /// Instantiate the stage named `op`.
    #[must_use]
    pub fn create(&self, op: &str) -> Option<Box<dyn Stage>> {
        self.descriptors.get(op).map(|d| (d.factory)())
    }

    /// Whether `op` is known.
    #[must_use]
    pub fn contains(&self, op: &str) -> bool {
        self.descriptors.contains_key(op)
    }

    /// Known operation names, sorted.
    #[must_use]
    pub fn ops(&self) -> Vec<&'static str> {
        let mut ops: Vec<_> = self.descriptors.keys().copied().collect();
        ops.sort_unstable();
        ops
    }
}
