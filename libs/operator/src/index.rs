//! Secondary indices over the watched resources.
//!
//! Reconcilers look objects up by fields the API server cannot serve
//! (compositions by synthesizer, synthesizers by watched kind, ...). The
//! indices are maintained incrementally from the shared watch streams and
//! are guaranteed to be populated before any reconciler starts: the runner
//! waits for the underlying reflector stores to sync first.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::RwLock;

use kube::{Resource, ResourceExt};

use eno_api::{Composition, ResourceSlice, Symphony, Synthesizer};

/// Namespace + name identity of a namespaced object.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_resource<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.meta().namespace.clone().unwrap_or_default(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// `(group, version, kind)` key for the per-kind watcher map and the
/// synthesizers-by-ref index.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GvkKey {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl fmt::Display for GvkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Target of a composition binding: which synthesizer, which object. The
/// binding key itself is rechecked by the caller against the synthesizer's
/// refs, so it is not part of the index key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BindingTarget {
    pub synthesizer: String,
    pub namespace: String,
    pub name: String,
}

/// Many-to-many map with reverse tracking so that re-indexing an object
/// removes its stale entries without needing the previous version.
struct ReverseIndex<K: Ord + Clone, V: Ord + Clone> {
    forward: BTreeMap<K, BTreeSet<V>>,
    back: BTreeMap<V, BTreeSet<K>>,
}

impl<K: Ord + Clone, V: Ord + Clone> ReverseIndex<K, V> {
    fn new() -> Self {
        Self {
            forward: BTreeMap::new(),
            back: BTreeMap::new(),
        }
    }

    fn apply(&mut self, id: V, keys: BTreeSet<K>) {
        self.remove(&id);
        for key in &keys {
            self.forward.entry(key.clone()).or_default().insert(id.clone());
        }
        if !keys.is_empty() {
            self.back.insert(id, keys);
        }
    }

    fn remove(&mut self, id: &V) {
        if let Some(old) = self.back.remove(id) {
            for key in old {
                if let Some(set) = self.forward.get_mut(&key) {
                    set.remove(id);
                    if set.is_empty() {
                        self.forward.remove(&key);
                    }
                }
            }
        }
    }

    fn get(&self, key: &K) -> Vec<V> {
        self.forward
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// All secondary indices, shared behind one `Arc` in the controller context.
pub struct Indexes {
    compositions_by_synthesizer: RwLock<ReverseIndex<String, NamespacedName>>,
    compositions_by_binding: RwLock<ReverseIndex<BindingTarget, NamespacedName>>,
    compositions_by_symphony: RwLock<ReverseIndex<NamespacedName, NamespacedName>>,
    synthesizers_by_ref: RwLock<ReverseIndex<GvkKey, String>>,
    slices_by_composition: RwLock<ReverseIndex<NamespacedName, NamespacedName>>,
}

impl Default for Indexes {
    fn default() -> Self {
        Self {
            compositions_by_synthesizer: RwLock::new(ReverseIndex::new()),
            compositions_by_binding: RwLock::new(ReverseIndex::new()),
            compositions_by_symphony: RwLock::new(ReverseIndex::new()),
            synthesizers_by_ref: RwLock::new(ReverseIndex::new()),
            slices_by_composition: RwLock::new(ReverseIndex::new()),
        }
    }
}

impl Indexes {
    pub fn apply_composition(&self, comp: &Composition) {
        let id = NamespacedName::from_resource(comp);

        self.compositions_by_synthesizer
            .write()
            .unwrap()
            .apply(id.clone(), [comp.synthesizer_name().to_string()].into());

        let bindings: BTreeSet<BindingTarget> = comp
            .spec
            .bindings
            .iter()
            .map(|b| BindingTarget {
                synthesizer: comp.synthesizer_name().to_string(),
                namespace: b
                    .resource
                    .namespace
                    .clone()
                    .unwrap_or_else(|| id.namespace.clone()),
                name: b.resource.name.clone(),
            })
            .collect();
        self.compositions_by_binding
            .write()
            .unwrap()
            .apply(id.clone(), bindings);

        let owners: BTreeSet<NamespacedName> = comp
            .owner_references()
            .iter()
            .filter(|o| o.kind == "Symphony")
            .map(|o| NamespacedName::new(id.namespace.clone(), o.name.clone()))
            .collect();
        self.compositions_by_symphony
            .write()
            .unwrap()
            .apply(id, owners);
    }

    pub fn delete_composition(&self, comp: &Composition) {
        let id = NamespacedName::from_resource(comp);
        self.compositions_by_synthesizer.write().unwrap().remove(&id);
        self.compositions_by_binding.write().unwrap().remove(&id);
        self.compositions_by_symphony.write().unwrap().remove(&id);
    }

    pub fn apply_synthesizer(&self, synth: &Synthesizer) {
        let gvks: BTreeSet<GvkKey> = synth
            .watched_gvks()
            .into_iter()
            .map(|(group, version, kind)| GvkKey {
                group,
                version,
                kind,
            })
            .collect();
        self.synthesizers_by_ref
            .write()
            .unwrap()
            .apply(synth.name_any(), gvks);
    }

    pub fn delete_synthesizer(&self, synth: &Synthesizer) {
        self.synthesizers_by_ref
            .write()
            .unwrap()
            .remove(&synth.name_any());
    }

    pub fn apply_slice(&self, slice: &ResourceSlice) {
        let id = NamespacedName::from_resource(slice);
        let owners: BTreeSet<NamespacedName> = slice
            .owner_references()
            .iter()
            .filter(|o| o.kind == "Composition")
            .map(|o| NamespacedName::new(id.namespace.clone(), o.name.clone()))
            .collect();
        self.slices_by_composition.write().unwrap().apply(id, owners);
    }

    pub fn delete_slice(&self, slice: &ResourceSlice) {
        let id = NamespacedName::from_resource(slice);
        self.slices_by_composition.write().unwrap().remove(&id);
    }

    pub fn compositions_for_synthesizer(&self, synthesizer: &str) -> Vec<NamespacedName> {
        self.compositions_by_synthesizer
            .read()
            .unwrap()
            .get(&synthesizer.to_string())
    }

    pub fn compositions_for_binding(&self, target: &BindingTarget) -> Vec<NamespacedName> {
        self.compositions_by_binding.read().unwrap().get(target)
    }

    pub fn compositions_for_symphony(&self, symphony: &NamespacedName) -> Vec<NamespacedName> {
        self.compositions_by_symphony.read().unwrap().get(symphony)
    }

    pub fn synthesizers_for_gvk(&self, gvk: &GvkKey) -> Vec<String> {
        self.synthesizers_by_ref.read().unwrap().get(gvk)
    }

    /// All GVKs referenced by at least one synthesizer. Drives the desired
    /// state of the input watch fabric.
    pub fn referenced_gvks(&self) -> Vec<GvkKey> {
        self.synthesizers_by_ref
            .read()
            .unwrap()
            .forward
            .keys()
            .cloned()
            .collect()
    }

    pub fn slices_for_composition(&self, composition: &NamespacedName) -> Vec<NamespacedName> {
        self.slices_by_composition.read().unwrap().get(composition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eno_api::{
        Binding, BoundResource, CompositionSpec, Ref, ResourceRef, SynthesizerRef, SynthesizerSpec,
    };

    fn composition(name: &str, synthesizer: &str, binding: Option<(&str, &str)>) -> Composition {
        let mut comp = Composition::new(
            name,
            CompositionSpec {
                synthesizer: SynthesizerRef {
                    name: synthesizer.into(),
                },
                bindings: binding
                    .map(|(key, obj)| {
                        vec![Binding {
                            key: key.into(),
                            resource: BoundResource {
                                name: obj.into(),
                                namespace: None,
                            },
                        }]
                    })
                    .unwrap_or_default(),
                synthesis_env: vec![],
            },
        );
        comp.metadata.namespace = Some("default".into());
        comp
    }

    #[test]
    fn compositions_indexed_by_synthesizer() {
        let indexes = Indexes::default();
        indexes.apply_composition(&composition("a", "syn-1", None));
        indexes.apply_composition(&composition("b", "syn-1", None));
        indexes.apply_composition(&composition("c", "syn-2", None));

        assert_eq!(indexes.compositions_for_synthesizer("syn-1").len(), 2);
        assert_eq!(indexes.compositions_for_synthesizer("syn-2").len(), 1);
        assert!(indexes.compositions_for_synthesizer("missing").is_empty());
    }

    #[test]
    fn reindex_replaces_stale_entries() {
        let indexes = Indexes::default();
        let mut comp = composition("a", "syn-1", None);
        indexes.apply_composition(&comp);

        comp.spec.synthesizer.name = "syn-2".into();
        indexes.apply_composition(&comp);

        assert!(indexes.compositions_for_synthesizer("syn-1").is_empty());
        assert_eq!(indexes.compositions_for_synthesizer("syn-2").len(), 1);

        indexes.delete_composition(&comp);
        assert!(indexes.compositions_for_synthesizer("syn-2").is_empty());
    }

    #[test]
    fn binding_target_defaults_to_composition_namespace() {
        let indexes = Indexes::default();
        indexes.apply_composition(&composition("a", "syn-1", Some(("cfg", "cm-input"))));

        let hits = indexes.compositions_for_binding(&BindingTarget {
            synthesizer: "syn-1".into(),
            namespace: "default".into(),
            name: "cm-input".into(),
        });
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "a");
    }

    #[test]
    fn slices_indexed_by_owner() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
        use eno_api::ResourceSliceSpec;

        let indexes = Indexes::default();
        let mut slice = ResourceSlice::new(
            "slice-1",
            ResourceSliceSpec {
                synthesis_uuid: "u".into(),
                composition_generation: 1,
                resources: vec![],
            },
        );
        slice.metadata.namespace = Some("default".into());
        slice.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "eno.azure.io/v1".into(),
            kind: "Composition".into(),
            name: "comp".into(),
            uid: "uid".into(),
            ..Default::default()
        }]);
        indexes.apply_slice(&slice);

        let owner = NamespacedName::new("default", "comp");
        assert_eq!(indexes.slices_for_composition(&owner).len(), 1);

        indexes.delete_slice(&slice);
        assert!(indexes.slices_for_composition(&owner).is_empty());
    }

    #[test]
    fn synthesizers_indexed_by_gvk() {
        let indexes = Indexes::default();
        let synth = Synthesizer::new(
            "syn-1",
            SynthesizerSpec {
                image: "img:1".into(),
                refs: vec![Ref {
                    key: "cfg".into(),
                    resource: ResourceRef {
                        version: "v1".into(),
                        kind: "ConfigMap".into(),
                        ..Default::default()
                    },
                    defer: false,
                }],
                ..Default::default()
            },
        );
        indexes.apply_synthesizer(&synth);

        let gvk = GvkKey {
            group: "".into(),
            version: "v1".into(),
            kind: "ConfigMap".into(),
        };
        assert_eq!(indexes.synthesizers_for_gvk(&gvk), vec!["syn-1".to_string()]);
        assert_eq!(indexes.referenced_gvks(), vec![gvk.clone()]);

        indexes.delete_synthesizer(&synth);
        assert!(indexes.synthesizers_for_gvk(&gvk).is_empty());
        assert!(indexes.referenced_gvks().is_empty());
    }
}
