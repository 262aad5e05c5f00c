// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Node type registry: type name → factory.
//!
//! Node types register at link time with [`register_node!`](crate::register_node)
//! and are collected into [`NODE_REGISTRY`] on first access. Additional types
//! can be registered at runtime with [`NodeRegistry::register`].

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;

use super::error::{PipelineError, Result};
use super::node::{FaceAnnotationNode, Node, NodeContext, NodeSpec, SinkNode, SourceNode};

/// Types used by macro-generated code. Not for direct use.
pub mod macro_codegen {
    use super::NodeRegistry;

    /// Link-time registration entry collected through `inventory`.
    pub struct NodeRegistration {
        pub register_fn: fn(&NodeRegistry),
    }

    inventory::collect!(NodeRegistration);
}

/// Factory signature for node types.
pub type NodeConstructorFn =
    Box<dyn Fn(&NodeSpec, &NodeContext) -> Result<Arc<dyn Node>> + Send + Sync>;

/// Register a node type under a string identifier at link time.
///
/// ```ignore
/// capturelib::register_node!("my_node", MyNode::create);
/// ```
#[macro_export]
macro_rules! register_node {
    ($type_name:expr, $constructor:expr) => {
        const _: () = {
            fn __register(registry: &$crate::core::registry::NodeRegistry) {
                registry.register_if_absent($type_name, $constructor);
            }

            $crate::inventory::submit! {
                $crate::core::registry::macro_codegen::NodeRegistration {
                    register_fn: __register,
                }
            }
        };
    };
}

register_node!(SourceNode::TYPE_NAME, SourceNode::create);
register_node!(FaceAnnotationNode::TYPE_NAME, FaceAnnotationNode::create);
register_node!(SinkNode::TYPE_NAME, SinkNode::create);

/// Process-wide registry holding every link-time registered node type.
pub static NODE_REGISTRY: LazyLock<NodeRegistry> = LazyLock::new(NodeRegistry::with_registered);

/// Maps node type names to factories.
pub struct NodeRegistry {
    constructors: RwLock<HashMap<String, NodeConstructorFn>>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            constructors: RwLock::new(HashMap::new()),
        }
    }

    /// A registry holding every type submitted with `register_node!`.
    pub fn with_registered() -> Self {
        let registry = Self::new();
        for registration in inventory::iter::<macro_codegen::NodeRegistration> {
            (registration.register_fn)(&registry);
        }
        tracing::debug!("[register] {} node types registered", registry.len());
        registry
    }

    /// Register a node type. Fails if the name is taken.
    pub fn register<F>(&self, type_name: &str, constructor: F) -> Result<()>
    where
        F: Fn(&NodeSpec, &NodeContext) -> Result<Arc<dyn Node>> + Send + Sync + 'static,
    {
        let mut constructors = self.constructors.write();
        if constructors.contains_key(type_name) {
            return Err(PipelineError::Configuration(format!(
                "Node type '{}' is already registered",
                type_name
            )));
        }
        constructors.insert(type_name.to_string(), Box::new(constructor));
        tracing::info!("[register] node type registered '{}'", type_name);
        Ok(())
    }

    /// Register unless the name is taken; duplicates are skipped.
    pub fn register_if_absent<F>(&self, type_name: &str, constructor: F) -> bool
    where
        F: Fn(&NodeSpec, &NodeContext) -> Result<Arc<dyn Node>> + Send + Sync + 'static,
    {
        if self.contains(type_name) {
            tracing::debug!(
                "[register] node type '{}' already registered, skipping duplicate",
                type_name
            );
            return false;
        }
        self.register(type_name, constructor).is_ok()
    }

    pub fn unregister(&self, type_name: &str) -> bool {
        self.constructors.write().remove(type_name).is_some()
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.constructors.read().contains_key(type_name)
    }

    /// Registered type names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.constructors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.read().is_empty()
    }

    /// Instantiate the node described by `spec`.
    pub fn create(&self, spec: &NodeSpec, ctx: &NodeContext) -> Result<Arc<dyn Node>> {
        let constructors = self.constructors.read();
        let constructor = constructors.get(&spec.node_type).ok_or_else(|| {
            PipelineError::NotFound(format!(
                "node type '{}' (for node '{}')",
                spec.node_type, spec.name
            ))
        })?;
        constructor(spec, ctx)
    }
}
