//! API types for the `eno.azure.io/v1` group.
//!
//! The four custom resources (`Synthesizer`, `Composition`, `ResourceSlice`,
//! `Symphony`) plus the pure status logic shared by the controllers and the
//! executor harness. Nothing in this crate talks to the API server.

pub mod composition;
pub mod resource_slice;
pub mod symphony;
pub mod synthesizer;

pub use composition::{
    Binding, BoundResource, Composition, CompositionSpec, CompositionStatus, EnvVar,
    InputRevisions, ResultEntry, ResultSeverity, SimplifiedStatus, Synthesis, SynthesizerRef,
};
pub use resource_slice::{Manifest, ResourceSlice, ResourceSliceSpec, ResourceSliceStatus, ResourceState};
pub use symphony::{
    prune_empty_annotations, Symphony, SymphonySpec, SymphonyStatus, Variation,
    VariationSynthesizer,
};
pub use synthesizer::{Ref, ResourceRef, Synthesizer, SynthesizerSpec, SynthesizerStatus};

/// The API group served by all Eno resources.
pub const GROUP: &str = "eno.azure.io";
/// The only served version.
pub const VERSION: &str = "v1";

/// Finalizer serializing ResourceSlice deletion with downstream reconciliation.
pub const CLEANUP_FINALIZER: &str = "eno.azure.io/cleanup";
/// Finalizer held by a Symphony until all child Compositions are gone.
pub const SYMPHONY_FINALIZER: &str = "eno.azure.io/symphony-cleanup";

/// Label stamped on every resource written by the Eno controllers.
pub const MANAGER_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGER: &str = "eno";

/// Labels on executor pods and Symphony-generated Compositions.
pub const COMPOSITION_NAME_LABEL: &str = "eno.azure.io/composition-name";
pub const COMPOSITION_NAMESPACE_LABEL: &str = "eno.azure.io/composition-namespace";
pub const SYNTHESIS_UUID_LABEL: &str = "eno.azure.io/synthesis-uuid";
pub const OWNER_SYMPHONY_LABEL: &str = "eno.azure.io/symphony";
pub const SYMPHONY_DELETING_LABEL: &str = "eno.azure.io/symphony-deleting";

/// Annotations read by the control plane.
pub const DELETION_STRATEGY_ANNOTATION: &str = "eno.azure.io/deletion-strategy";
pub const IGNORE_SIDE_EFFECTS_ANNOTATION: &str = "eno.azure.io/ignore-side-effects";
/// Written by the executor onto every input object handed to the synthesizer.
pub const INPUT_KEY_ANNOTATION: &str = "eno.azure.io/input-key";

/// Annotations consumed downstream, opaque to the control plane.
pub const REPLACE_ANNOTATION: &str = "eno.azure.io/replace";
pub const OVERRIDES_ANNOTATION: &str = "eno.azure.io/overrides";
pub const READINESS_GROUP_ANNOTATION: &str = "eno.azure.io/readiness-group";
pub const RECONCILE_INTERVAL_ANNOTATION: &str = "eno.azure.io/reconcile-interval";

/// Value of [`DELETION_STRATEGY_ANNOTATION`] requesting that downstream
/// resources be left in place when the Composition goes away.
pub const DELETION_STRATEGY_ORPHAN: &str = "orphan";

/// Environment variables naming the attempt inside the executor pod.
pub const ENV_COMPOSITION_NAME: &str = "ENO_COMPOSITION_NAME";
pub const ENV_COMPOSITION_NAMESPACE: &str = "ENO_COMPOSITION_NAMESPACE";
pub const ENV_COMPOSITION_UID: &str = "ENO_COMPOSITION_UID";
pub const ENV_SYNTHESIS_UUID: &str = "ENO_SYNTHESIS_UUID";
