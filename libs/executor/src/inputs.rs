//! Input resolution: fetch every object bound to the synthesizer's refs and
//! present them as annotated ResourceList items.

use crate::error::{Error, Result};
use crate::krm;

use kube::api::{Api, DynamicObject};
use kube::{Client, ResourceExt};
use serde_json::Value;
use tracing::debug;

use eno_api::{Composition, Synthesizer};

/// Resolve the concrete object behind one ref: the ref's own pin, or the
/// composition's binding for the key.
fn resolve_target<'a>(
    comp: &'a Composition,
    r: &'a eno_api::Ref,
) -> Result<(&'a str, Option<String>)> {
    if let Some(name) = &r.resource.name {
        return Ok((name, r.resource.namespace.clone()));
    }
    let binding = comp
        .binding_for_key(&r.key)
        .ok_or_else(|| Error::MissingBinding { key: r.key.clone() })?;
    let namespace = binding.resource.namespace.clone().or_else(|| comp.namespace());
    Ok((&binding.resource.name, namespace))
}

/// Fetch all inputs, annotated with their binding key, in ref order.
pub async fn fetch_all(
    client: &Client,
    comp: &Composition,
    synth: &Synthesizer,
) -> Result<Vec<Value>> {
    let mut items = Vec::with_capacity(synth.spec.refs.len());
    for r in &synth.spec.refs {
        let gvk = r.resource.gvk();
        let (api_resource, caps) = kube::discovery::pinned_kind(client, &gvk)
            .await
            .map_err(|source| Error::Discovery {
                gvk: format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind),
                source,
            })?;

        let (name, namespace) = resolve_target(comp, r)?;
        let api: Api<DynamicObject> = match (&caps.scope, &namespace) {
            (kube::discovery::Scope::Namespaced, Some(ns)) => {
                Api::namespaced_with(client.clone(), ns, &api_resource)
            }
            _ => Api::all_with(client.clone(), &api_resource),
        };

        let obj = api.get(name).await.map_err(|source| match source {
            kube::Error::Api(ae) if ae.code == 404 => Error::MissingInput {
                key: r.key.clone(),
                name: name.to_string(),
            },
            source => Error::Kube(source),
        })?;
        debug!(
            msg = "fetched input",
            key = r.key,
            kind = r.resource.kind,
            name,
            resource_version = obj.resource_version().unwrap_or_default()
        );

        let value = serde_json::to_value(&obj)?;
        items.push(krm::annotate_input(value, &r.key));
    }
    Ok(items)
}
