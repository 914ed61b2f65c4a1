//! Executor harness: runs inside the synthesizer pod. Reads the attempt
//! coordinates from the environment, feeds the bound inputs to the user
//! synthesizer as a KRM ResourceList, shards its output into
//! ResourceSlices and records the outcome on the Composition.

pub mod error;
pub mod inputs;
pub mod krm;
pub mod process;
pub mod slices;

pub use error::{Error, Result};

use kube::api::Api;
use kube::Client;
use tracing::{info, warn};

use eno_api::{Composition, Synthesizer};

/// Attempt coordinates injected by the pod lifecycle controller.
#[derive(Clone, Debug)]
pub struct ExecutorEnv {
    pub composition_name: String,
    pub composition_namespace: String,
    pub composition_uid: String,
    pub synthesis_uuid: String,
    /// Budget for slice creation writes, per second.
    pub slice_creation_qps: u32,
}

impl ExecutorEnv {
    pub fn from_env() -> Result<Self> {
        let var = |name: &'static str| {
            std::env::var(name).map_err(|_| Error::MissingEnv(name))
        };
        Ok(Self {
            composition_name: var(eno_api::ENV_COMPOSITION_NAME)?,
            composition_namespace: var(eno_api::ENV_COMPOSITION_NAMESPACE)?,
            composition_uid: var(eno_api::ENV_COMPOSITION_UID)?,
            synthesis_uuid: var(eno_api::ENV_SYNTHESIS_UUID)?,
            slice_creation_qps: std::env::var("ENO_SLICE_CREATION_QPS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
        })
    }
}

/// Execute one synthesis attempt end to end. Terminal user errors are
/// recorded on the attempt before the error is returned; the binary exits
/// non-zero and the pod lifecycle controller takes it from there.
pub async fn run(client: Client, env: ExecutorEnv) -> Result<()> {
    let comp_api: Api<Composition> =
        Api::namespaced(client.clone(), &env.composition_namespace);
    let comp = comp_api.get(&env.composition_name).await?;

    // Restarted after the controller already promoted this attempt.
    if comp
        .current_synthesis()
        .is_some_and(|s| s.uuid == env.synthesis_uuid)
    {
        info!(msg = "attempt already promoted, nothing to do", uuid = env.synthesis_uuid);
        return Ok(());
    }
    let Some(attempt) = comp
        .in_flight_synthesis()
        .filter(|s| s.uuid == env.synthesis_uuid)
        .cloned()
    else {
        // Reclaimed while this pod was starting; the orphan sweep deletes us.
        warn!(msg = "attempt is not in flight, exiting", uuid = env.synthesis_uuid);
        return Ok(());
    };

    let synth_api: Api<Synthesizer> = Api::all(client.clone());
    let synth = synth_api.get(comp.synthesizer_name()).await?;

    let input_items = inputs::fetch_all(&client, &comp, &synth).await?;
    let input_list = krm::ResourceList::new(input_items);

    let output = match process::invoke(&synth, &input_list).await {
        Ok(output) => output,
        Err(err) if err.is_terminal() => {
            slices::record_results(
                &comp_api,
                &env.composition_name,
                &env.synthesis_uuid,
                err.result_entries(),
            )
            .await?;
            return Err(err);
        }
        Err(err) => return Err(err),
    };

    if output.list.has_error() {
        // the synthesizer spoke: terminal, no slices are written
        slices::record_results(
            &comp_api,
            &env.composition_name,
            &env.synthesis_uuid,
            output.list.result_entries(),
        )
        .await?;
        return Err(Error::SynthesizerError);
    }

    let partitions = krm::partition(&output.list.items, slices::MAX_SLICE_BYTES);
    let names = slices::write_all(
        &client,
        &comp,
        &attempt,
        partitions,
        env.slice_creation_qps,
    )
    .await?;
    slices::record_synthesized(
        &comp_api,
        &env.composition_name,
        &env.synthesis_uuid,
        names,
        output.list.result_entries(),
    )
    .await?;
    info!(msg = "synthesis complete", uuid = env.synthesis_uuid);
    Ok(())
}
