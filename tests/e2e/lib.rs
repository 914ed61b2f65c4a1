#[cfg(all(test, feature = "e2e-tests"))]
mod test {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
    use kube::client::Client;
    use kube::runtime::wait::{await_condition, conditions, Condition};
    use kube::ResourceExt;
    use serde_json::json;
    use tokio::time::timeout;

    use eno_api::{
        Binding, BoundResource, Composition, CompositionSpec, Ref, ResourceRef, ResourceSlice,
        Symphony, SymphonySpec, Synthesizer, SynthesizerRef, SynthesizerSpec, Variation,
        VariationSynthesizer,
    };

    const NAMESPACE: &str = "default";

    /// The e2e synthesizer image echoes a single ConfigMap named after the
    /// `cfg` input's `out-name` data key, carrying its `k` value through.
    fn synth_image() -> String {
        std::env::var("E2E_SYNTH_IMAGE").unwrap_or_else(|_| "eno-e2e-synth:latest".to_string())
    }

    fn synthesizer(name: &str, defer: bool) -> Synthesizer {
        Synthesizer::new(
            name,
            SynthesizerSpec {
                image: synth_image(),
                command: vec!["/synth".into()],
                refs: vec![Ref {
                    key: "cfg".into(),
                    resource: ResourceRef {
                        version: "v1".into(),
                        kind: "ConfigMap".into(),
                        ..Default::default()
                    },
                    defer,
                }],
                ..Default::default()
            },
        )
    }

    fn composition(name: &str, synthesizer: &str, input: &str) -> Composition {
        Composition::new(
            name,
            CompositionSpec {
                synthesizer: SynthesizerRef {
                    name: synthesizer.into(),
                },
                bindings: vec![Binding {
                    key: "cfg".into(),
                    resource: BoundResource {
                        name: input.into(),
                        namespace: None,
                    },
                }],
                synthesis_env: vec![],
            },
        )
    }

    fn input_config_map(name: &str, value: &str) -> ConfigMap {
        ConfigMap {
            metadata: kube::api::ObjectMeta {
                name: Some(name.into()),
                namespace: Some(NAMESPACE.into()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                ("k".to_string(), value.to_string()),
                ("out-name".to_string(), format!("{name}-out")),
            ])),
            ..Default::default()
        }
    }

    fn is_synthesized() -> impl Condition<Composition> {
        |obj: Option<&Composition>| {
            obj.and_then(|c| c.status.as_ref())
                .and_then(|s| s.current_synthesis.as_ref())
                .is_some_and(|s| s.synthesized.is_some())
        }
    }

    fn is_reconciled() -> impl Condition<Composition> {
        |obj: Option<&Composition>| {
            obj.and_then(|c| c.status.as_ref())
                .and_then(|s| s.current_synthesis.as_ref())
                .is_some_and(|s| s.reconciled.is_some())
        }
    }

    fn is_ready() -> impl Condition<Composition> {
        |obj: Option<&Composition>| {
            obj.and_then(|c| c.status.as_ref())
                .and_then(|s| s.current_synthesis.as_ref())
                .is_some_and(|s| s.ready.is_some())
        }
    }

    fn observed_synthesizer_generation_at_least(generation: i64) -> impl Condition<Composition> {
        move |obj: Option<&Composition>| {
            obj.and_then(|c| c.status.as_ref())
                .and_then(|s| s.current_synthesis.as_ref())
                .is_some_and(|s| s.observed_synthesizer_generation >= generation)
        }
    }

    fn has_input_revision(resource_version: String) -> impl Condition<Composition> {
        move |obj: Option<&Composition>| {
            obj.and_then(|c| c.status.as_ref())
                .is_some_and(|s| {
                    s.input_revisions
                        .iter()
                        .any(|r| r.key == "cfg" && r.resource_version == resource_version)
                })
        }
    }

    fn has_pending_resynthesis() -> impl Condition<Composition> {
        |obj: Option<&Composition>| {
            obj.and_then(|c| c.status.as_ref())
                .is_some_and(|s| s.pending_resynthesis.is_some())
        }
    }

    fn current_uuid_differs(uuid: String) -> impl Condition<Composition> {
        move |obj: Option<&Composition>| {
            obj.and_then(|c| c.status.as_ref())
                .and_then(|s| s.current_synthesis.as_ref())
                .is_some_and(|s| s.uuid != uuid && s.synthesized.is_some())
        }
    }

    fn symphony_ready() -> impl Condition<Symphony> {
        |obj: Option<&Symphony>| {
            obj.and_then(|s| s.status.as_ref())
                .is_some_and(|s| s.ready.is_some())
        }
    }

    async fn wait_for<R, C>(api: Api<R>, name: &str, condition: C, secs: u64)
    where
        R: kube::Resource
            + Clone
            + std::fmt::Debug
            + for<'de> k8s_openapi::serde::Deserialize<'de>
            + 'static
            + Send,
        C: Condition<R>,
    {
        timeout(
            Duration::from_secs(secs),
            await_condition(api, name, condition),
        )
        .await
        .unwrap()
        .unwrap();
    }

    struct Fixture {
        client: Client,
        synthesizers: Api<Synthesizer>,
        compositions: Api<Composition>,
        slices: Api<ResourceSlice>,
        config_maps: Api<ConfigMap>,
    }

    impl Fixture {
        async fn new() -> Self {
            let client = Client::try_default().await.unwrap();
            Self {
                synthesizers: Api::all(client.clone()),
                compositions: Api::namespaced(client.clone(), NAMESPACE),
                slices: Api::namespaced(client.clone(), NAMESPACE),
                config_maps: Api::namespaced(client.clone(), NAMESPACE),
                client,
            }
        }

        /// Create synthesizer, input and composition; wait until ready.
        async fn setup(&self, name: &str, defer: bool) -> Composition {
            self.config_maps
                .create(&PostParams::default(), &input_config_map(name, "v1"))
                .await
                .unwrap();
            self.synthesizers
                .create(&PostParams::default(), &synthesizer(name, defer))
                .await
                .unwrap();
            self.compositions
                .create(&PostParams::default(), &composition(name, name, name))
                .await
                .unwrap();

            wait_for(self.compositions.clone(), name, is_synthesized(), 120).await;
            wait_for(self.compositions.clone(), name, is_reconciled(), 120).await;
            wait_for(self.compositions.clone(), name, is_ready(), 120).await;
            self.compositions.get(name).await.unwrap()
        }

        async fn slices_of(&self, comp: &Composition) -> Vec<ResourceSlice> {
            let uuid = comp
                .status
                .as_ref()
                .and_then(|s| s.current_synthesis.as_ref())
                .map(|s| s.uuid.clone())
                .unwrap();
            self.slices
                .list(&ListParams::default().labels(&format!(
                    "{}={uuid}",
                    eno_api::SYNTHESIS_UUID_LABEL
                )))
                .await
                .unwrap()
                .items
        }
    }

    #[tokio::test]
    async fn cold_create() {
        let name = "e2e-cold-create";
        let f = Fixture::new().await;
        let comp = f.setup(name, false).await;

        // exactly one slice backs the attempt, and the echoed ConfigMap
        // landed in the target cluster
        let slices = f.slices_of(&comp).await;
        assert_eq!(slices.len(), 1);
        let out = f
            .config_maps
            .get(&format!("{name}-out"))
            .await
            .unwrap();
        assert_eq!(out.data.unwrap().get("k").map(String::as_str), Some("v1"));
    }

    #[tokio::test]
    async fn synthesizer_update_rolls_out_once() {
        let name = "e2e-syn-update";
        let f = Fixture::new().await;
        let before = f.setup(name, false).await;
        let old_slices = f.slices_of(&before).await;

        let mut synth = f.synthesizers.get(name).await.unwrap();
        synth.spec.command = vec!["/synth".into(), "--value=v2".into()];
        synth.metadata.managed_fields = None;
        f.synthesizers
            .patch(
                name,
                &PatchParams::apply("e2e-tests").force(),
                &Patch::Apply(&synth),
            )
            .await
            .unwrap();
        let new_generation = f
            .synthesizers
            .get(name)
            .await
            .unwrap()
            .metadata
            .generation
            .unwrap();

        wait_for(
            f.compositions.clone(),
            name,
            observed_synthesizer_generation_at_least(new_generation),
            180,
        )
        .await;
        wait_for(f.compositions.clone(), name, is_ready(), 120).await;

        // the superseded slice is cleaned up after the new one reconciles
        for slice in old_slices {
            wait_for(
                f.slices.clone(),
                &slice.name_any(),
                conditions::is_deleted(&slice.uid().unwrap()),
                180,
            )
            .await;
        }
        let out = f
            .config_maps
            .get(&format!("{name}-out"))
            .await
            .unwrap();
        assert_eq!(out.data.unwrap().get("k").map(String::as_str), Some("v2"));
    }

    #[tokio::test]
    async fn input_change_resynthesizes_without_cooldown() {
        let name = "e2e-input-change";
        let f = Fixture::new().await;
        let before = f.setup(name, false).await;
        let old_uuid = before
            .status
            .as_ref()
            .unwrap()
            .current_synthesis
            .as_ref()
            .unwrap()
            .uuid
            .clone();

        let patched = f
            .config_maps
            .patch(
                name,
                &PatchParams::default(),
                &Patch::Merge(&json!({"data": {"k": "v2"}})),
            )
            .await
            .unwrap();
        let rv = patched.resource_version().unwrap();

        // the fabric stamps the revision promptly, then a fresh attempt
        // runs without waiting out the rollout cooldown
        wait_for(f.compositions.clone(), name, has_input_revision(rv), 30).await;
        wait_for(
            f.compositions.clone(),
            name,
            current_uuid_differs(old_uuid),
            60,
        )
        .await;
    }

    #[tokio::test]
    async fn deferred_input_waits_for_cooldown() {
        let name = "e2e-deferred";
        let f = Fixture::new().await;
        let before = f.setup(name, true).await;
        let old_uuid = before
            .status
            .as_ref()
            .unwrap()
            .current_synthesis
            .as_ref()
            .unwrap()
            .uuid
            .clone();

        f.config_maps
            .patch(
                name,
                &PatchParams::default(),
                &Patch::Merge(&json!({"data": {"k": "v2"}})),
            )
            .await
            .unwrap();

        wait_for(f.compositions.clone(), name, has_pending_resynthesis(), 30).await;

        // still the old attempt while the cooldown runs
        let comp = f.compositions.get(name).await.unwrap();
        assert_eq!(
            comp.status
                .unwrap()
                .current_synthesis
                .unwrap()
                .uuid,
            old_uuid
        );

        // rollout cooldown in the e2e deployment is 1m
        wait_for(
            f.compositions.clone(),
            name,
            current_uuid_differs(old_uuid),
            180,
        )
        .await;
    }

    #[tokio::test]
    async fn missing_slice_is_replaced() {
        let name = "e2e-missing-slice";
        let f = Fixture::new().await;
        let comp = f.setup(name, false).await;
        let old_uuid = comp
            .status
            .as_ref()
            .unwrap()
            .current_synthesis
            .as_ref()
            .unwrap()
            .uuid
            .clone();

        for slice in f.slices_of(&comp).await {
            f.slices
                .delete(&slice.name_any(), &DeleteParams::default())
                .await
                .unwrap();
        }

        // recovery forces a new attempt which writes a replacement slice
        wait_for(
            f.compositions.clone(),
            name,
            current_uuid_differs(old_uuid),
            180,
        )
        .await;
        let comp = f.compositions.get(name).await.unwrap();
        assert!(!f.slices_of(&comp).await.is_empty());
    }

    #[tokio::test]
    async fn symphony_delete_orphans_downstream() {
        let name = "e2e-symphony";
        let f = Fixture::new().await;

        for suffix in ["a", "b"] {
            let synth_name = format!("{name}-{suffix}");
            f.config_maps
                .create(
                    &PostParams::default(),
                    &input_config_map(&synth_name, "v1"),
                )
                .await
                .unwrap();
            f.synthesizers
                .create(&PostParams::default(), &synthesizer(&synth_name, false))
                .await
                .unwrap();
        }

        let symphonies: Api<Symphony> = Api::namespaced(f.client.clone(), NAMESPACE);
        let symphony = Symphony::new(
            name,
            SymphonySpec {
                variations: ["a", "b"]
                    .into_iter()
                    .map(|suffix| Variation {
                        synthesizer: VariationSynthesizer {
                            name: format!("{name}-{suffix}"),
                        },
                        bindings: Some(vec![Binding {
                            key: "cfg".into(),
                            resource: BoundResource {
                                name: format!("{name}-{suffix}"),
                                namespace: None,
                            },
                        }]),
                        ..Default::default()
                    })
                    .collect(),
                bindings: vec![],
            },
        );
        symphonies
            .create(&PostParams::default(), &symphony)
            .await
            .unwrap();
        wait_for(symphonies.clone(), name, symphony_ready(), 300).await;

        let symphony = symphonies.get(name).await.unwrap();
        symphonies
            .delete(name, &DeleteParams::default())
            .await
            .unwrap();
        wait_for(
            symphonies.clone(),
            name,
            conditions::is_deleted(&symphony.uid().unwrap()),
            180,
        )
        .await;

        // both children are gone
        let children = f
            .compositions
            .list(&ListParams::default().labels(&format!(
                "{}={name}",
                eno_api::OWNER_SYMPHONY_LABEL
            )))
            .await
            .unwrap();
        assert!(children.items.is_empty());

        // the default deletion strategy orphans downstream resources
        for suffix in ["a", "b"] {
            let out = f
                .config_maps
                .get(&format!("{name}-{suffix}-out"))
                .await
                .unwrap();
            assert!(out.data.is_some());
        }
    }
}
