//! Relocating the Cluster API object graph
//!
//! Objects are created in the target before they are deleted from the source,
//! and children are deleted from the source before their parents:
//!
//! ```text
//! for each Cluster:
//!   ensure namespace ─► create Cluster ─► move infrastructureRef
//!   ─► move "<cluster>*" Secrets (owned by the new Cluster)
//!   ─► MachineDeployments ─► MachineSets ─► Machines
//!   ─► force delete Cluster
//! then MachineDeployments, MachineSets and Machines belonging to no Cluster
//! ```
//!
//! Source objects are force deleted: finalizers are cleared first because the
//! controllers that would clear them have been scaled down. Any failure stops
//! the move where it is; re-running it picks up the objects still in the
//! source, since creates in the target tolerate objects already moved.

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use futures::future::join_all;
use k8s_openapi::api::core::v1::{Namespace, ObjectReference, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use tracing::{debug, info};

use tugboat_common::crd::{
    Cluster, Machine, MachineDeployment, MachineSet, MachineSpec, CAPI_GROUP, CAPI_VERSION,
};
use tugboat_common::kube_utils::poll_until;
use tugboat_common::{
    Error, ErrorContext, Gvk, LabelSelector, ListQuery, ObjectKey, ObjectStore, Propagation,
    Resource, Result, CLUSTER_NAME_LABEL,
};

use crate::config::MoverConfig;

/// Moves Clusters and their machines from one management cluster to another
pub struct ObjectMover {
    source: Arc<dyn ObjectStore>,
    target: Arc<dyn ObjectStore>,
    config: MoverConfig,
}

impl ObjectMover {
    /// Mover with default timing
    pub fn new(source: Arc<dyn ObjectStore>, target: Arc<dyn ObjectStore>) -> Self {
        Self::with_config(source, target, MoverConfig::default())
    }

    /// Mover with explicit timing
    pub fn with_config(
        source: Arc<dyn ObjectStore>,
        target: Arc<dyn ObjectStore>,
        config: MoverConfig,
    ) -> Self {
        Self {
            source,
            target,
            config,
        }
    }

    /// Move every Cluster and every machine resource
    pub async fn pivot(&self) -> Result<()> {
        self.wait_for_cluster_api(&self.source, "source").await?;
        self.wait_for_cluster_api(&self.target, "target").await?;

        let clusters: Vec<Cluster> =
            list_typed(self.source.as_ref(), ListQuery::of(Gvk::of::<Cluster>())).await?;
        info!(count = clusters.len(), "Moving Clusters");
        for cluster in clusters {
            let key = ObjectKey::of(&cluster);
            self.move_cluster(cluster)
                .await
                .context_with(|| format!("moving {}", key))?;
        }

        self.move_standalone()
            .await
            .context_with(|| "moving machine resources without a Cluster")?;

        info!("Object graph moved");
        Ok(())
    }

    async fn wait_for_cluster_api(&self, store: &Arc<dyn ObjectStore>, side: &str) -> Result<()> {
        let store = store.clone();
        poll_until(
            self.config.api_ready_timeout,
            self.config.api_ready_interval,
            format!("Cluster API to be served by the {} cluster", side),
            || {
                let store = store.clone();
                async move {
                    store.list(&ListQuery::of(Gvk::of::<Cluster>())).await?;
                    Ok(true)
                }
            },
        )
        .await
    }

    async fn move_cluster(&self, cluster: Cluster) -> Result<()> {
        let namespace = cluster.metadata.namespace.clone().unwrap_or_default();
        let name = cluster.metadata.name.clone().unwrap_or_default();
        info!(cluster = %name, namespace = %namespace, "Moving Cluster");

        self.ensure_target_namespace(&namespace).await?;

        let mut copy = Resource::Cluster(cluster.clone());
        reset_identity(&mut copy);
        let created = create_in_target(self.target.as_ref(), &copy).await?;
        let target_uid = created.meta().uid.clone().unwrap_or_default();

        if let Some(reference) = &cluster.spec.infrastructure_ref {
            self.move_reference(reference, &namespace).await?;
        }

        self.move_cluster_secrets(&namespace, &name, &target_uid).await?;

        let selector = LabelSelector::new().eq(CLUSTER_NAME_LABEL, &name);
        let deployments: Vec<MachineDeployment> = list_typed(
            self.source.as_ref(),
            ListQuery::of(Gvk::of::<MachineDeployment>())
                .in_namespace(&namespace)
                .with_labels(selector.clone()),
        )
        .await?;
        for deployment in deployments {
            let key = ObjectKey::of(&deployment);
            self.move_machine_deployment(deployment)
                .await
                .context_with(|| format!("moving {}", key))?;
        }

        let sets: Vec<MachineSet> = list_typed(
            self.source.as_ref(),
            ListQuery::of(Gvk::of::<MachineSet>())
                .in_namespace(&namespace)
                .with_labels(selector.clone()),
        )
        .await?;
        for set in sets {
            let key = ObjectKey::of(&set);
            self.move_machine_set(set)
                .await
                .context_with(|| format!("moving {}", key))?;
        }

        let machines: Vec<Machine> = list_typed(
            self.source.as_ref(),
            ListQuery::of(Gvk::of::<Machine>())
                .in_namespace(&namespace)
                .with_labels(selector),
        )
        .await?;
        self.move_machines(machines).await?;

        force_delete(self.source.as_ref(), &ObjectKey::of(&cluster), None).await
    }

    /// Create the namespace in the target unless it is already there.
    ///
    /// Users allowed to work in a namespace are not always allowed to read or
    /// create Namespace objects, so a forbidden answer falls back to listing.
    async fn ensure_target_namespace(&self, namespace: &str) -> Result<()> {
        let key = ObjectKey::cluster_scoped(Gvk::of::<Namespace>(), namespace);
        match self.target.get(&key).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_not_found() => {}
            Err(e) if e.is_forbidden() => {
                if self.target_lists_namespace(namespace).await? {
                    return Ok(());
                }
                return Err(e.with_context(format!("reading {}", key)));
            }
            Err(e) => return Err(e.with_context(format!("reading {}", key))),
        }

        let ns = Resource::Namespace(Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        let err = match self.target.create(&ns).await {
            Ok(_) => {
                info!(namespace = %namespace, "Created namespace in target cluster");
                return Ok(());
            }
            Err(e) if e.is_already_exists() => return Ok(()),
            Err(e) => e,
        };
        if err.is_forbidden() && self.target_lists_namespace(namespace).await? {
            return Ok(());
        }
        Err(err.with_context(format!("creating {}", key)))
    }

    async fn target_lists_namespace(&self, namespace: &str) -> Result<bool> {
        let namespaces = self
            .target
            .list(&ListQuery::of(Gvk::of::<Namespace>()))
            .await
            .context_with(|| "listing namespaces in the target cluster")?;
        Ok(namespaces.iter().any(|ns| ns.name() == namespace))
    }

    /// Move an object only known by reference
    async fn move_reference(&self, reference: &ObjectReference, namespace: &str) -> Result<()> {
        let key = ObjectKey::from_reference(reference, namespace)?;
        let mut obj = match self.source.get(&key).await {
            Ok(obj) => obj,
            Err(e) => {
                // moved by an earlier, interrupted run
                if e.is_not_found() && self.target.get(&key).await.is_ok() {
                    debug!(object = %key, "Referenced object already moved");
                    return Ok(());
                }
                return Err(e.with_context(format!("reading {}", key)));
            }
        };
        reset_identity(&mut obj);
        obj.clear_owner_references();
        create_in_target(self.target.as_ref(), &obj).await?;
        force_delete(self.source.as_ref(), &key, None).await?;
        debug!(object = %key, "Moved referenced object");
        Ok(())
    }

    async fn move_template_references(&self, spec: &MachineSpec, namespace: &str) -> Result<()> {
        for reference in spec
            .infrastructure_ref
            .iter()
            .chain(spec.bootstrap.config_ref.iter())
        {
            self.move_reference(reference, namespace).await?;
        }
        Ok(())
    }

    /// Secrets whose name starts with the Cluster name, re-owned by the
    /// Cluster in the target
    async fn move_cluster_secrets(&self, namespace: &str, cluster: &str, target_uid: &str) -> Result<()> {
        let secrets: Vec<Secret> = list_typed(
            self.source.as_ref(),
            ListQuery::of(Gvk::of::<Secret>()).in_namespace(namespace),
        )
        .await?;

        for secret in secrets
            .into_iter()
            .filter(|s| s.metadata.name.as_deref().is_some_and(|n| n.starts_with(cluster)))
        {
            let key = ObjectKey::of(&secret);
            let mut obj = Resource::Secret(secret);
            reset_identity(&mut obj);
            obj.meta_mut().owner_references = Some(vec![OwnerReference {
                api_version: format!("{}/{}", CAPI_GROUP, CAPI_VERSION),
                kind: "Cluster".to_string(),
                name: cluster.to_string(),
                uid: target_uid.to_string(),
                ..Default::default()
            }]);
            create_in_target(self.target.as_ref(), &obj).await?;
            force_delete(self.source.as_ref(), &key, None).await?;
            info!(secret = %key.name, cluster = %cluster, "Moved Secret");
        }
        Ok(())
    }

    async fn move_machine_deployment(&self, deployment: MachineDeployment) -> Result<()> {
        let key = ObjectKey::of(&deployment);
        let namespace = key.namespace.clone().unwrap_or_default();
        info!(machine_deployment = %key.name, namespace = %namespace, "Moving MachineDeployment");

        let uid = deployment.metadata.uid.clone().unwrap_or_default();
        let sets: Vec<MachineSet> = list_typed(
            self.source.as_ref(),
            ListQuery::of(Gvk::of::<MachineSet>()).in_namespace(&namespace),
        )
        .await?;
        for set in sets.into_iter().filter(|s| owned_by(&s.metadata, &uid)) {
            let key = ObjectKey::of(&set);
            self.move_machine_set(set)
                .await
                .context_with(|| format!("moving {}", key))?;
        }

        self.move_template_references(&deployment.spec.template.spec, &namespace)
            .await?;

        let mut obj = Resource::MachineDeployment(deployment);
        reset_identity(&mut obj);
        obj.clear_owner_references();
        create_in_target(self.target.as_ref(), &obj).await?;
        force_delete(self.source.as_ref(), &key, Some(Propagation::Foreground)).await
    }

    async fn move_machine_set(&self, set: MachineSet) -> Result<()> {
        let key = ObjectKey::of(&set);
        let namespace = key.namespace.clone().unwrap_or_default();
        info!(machine_set = %key.name, namespace = %namespace, "Moving MachineSet");

        let uid = set.metadata.uid.clone().unwrap_or_default();
        let machines: Vec<Machine> = list_typed(
            self.source.as_ref(),
            ListQuery::of(Gvk::of::<Machine>()).in_namespace(&namespace),
        )
        .await?;
        self.move_machines(
            machines
                .into_iter()
                .filter(|m| owned_by(&m.metadata, &uid))
                .collect(),
        )
        .await?;

        // a MachineDeployment's template is moved with the MachineDeployment
        if !owned_by_kind(&set.metadata, "MachineDeployment") {
            self.move_template_references(&set.spec.template.spec, &namespace)
                .await?;
        }

        let mut obj = Resource::MachineSet(set);
        reset_identity(&mut obj);
        obj.clear_owner_references();
        create_in_target(self.target.as_ref(), &obj).await?;
        force_delete(self.source.as_ref(), &key, Some(Propagation::Foreground)).await
    }

    /// Move a batch of Machines concurrently.
    ///
    /// Every Machine is attempted; the first failure is reported once all
    /// of them have finished.
    async fn move_machines(&self, machines: Vec<Machine>) -> Result<()> {
        let timeout = self.config.machine_ready_timeout();
        let first_error: OnceLock<Error> = OnceLock::new();

        let moves = machines
            .into_iter()
            .filter(|m| {
                let skip = m.metadata.deletion_timestamp.is_some();
                if skip {
                    debug!(machine = ?m.metadata.name, "Skipping Machine being deleted");
                }
                !skip
            })
            .map(|machine| {
                let first_error = &first_error;
                async move {
                    let key = ObjectKey::of(&machine);
                    if let Err(e) = self.move_machine(machine, timeout).await {
                        // later failures are dropped
                        let _ = first_error.set(e.with_context(format!("moving {}", key)));
                    }
                }
            });
        join_all(moves).await;

        match first_error.into_inner() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn move_machine(&self, machine: Machine, timeout: std::time::Duration) -> Result<()> {
        let key = ObjectKey::of(&machine);
        let namespace = key.namespace.clone().unwrap_or_default();

        self.move_template_references(&machine.spec, &namespace).await?;

        let mut obj = Resource::Machine(machine);
        reset_identity(&mut obj);
        obj.clear_owner_references();
        create_in_target(self.target.as_ref(), &obj).await?;

        let target = self.target.clone();
        let wait_key = key.clone();
        poll_until(
            timeout,
            self.config.machine_ready_interval,
            format!("{} to get a node", key),
            || {
                let target = target.clone();
                let key = wait_key.clone();
                async move {
                    match target.get(&key).await? {
                        Resource::Machine(m) => Ok(m.has_node_ref()),
                        _ => Ok(false),
                    }
                }
            },
        )
        .await?;

        force_delete(self.source.as_ref(), &key, Some(Propagation::Foreground)).await?;
        info!(machine = %key.name, namespace = %namespace, "Moved Machine");
        Ok(())
    }

    /// Machine resources that belong to no Cluster
    async fn move_standalone(&self) -> Result<()> {
        let deployments: Vec<MachineDeployment> =
            list_typed(self.source.as_ref(), ListQuery::of(Gvk::of::<MachineDeployment>())).await?;
        for deployment in deployments {
            let key = ObjectKey::of(&deployment);
            self.ensure_target_namespace(key.namespace.as_deref().unwrap_or_default())
                .await?;
            self.move_machine_deployment(deployment)
                .await
                .context_with(|| format!("moving {}", key))?;
        }

        let sets: Vec<MachineSet> =
            list_typed(self.source.as_ref(), ListQuery::of(Gvk::of::<MachineSet>())).await?;
        for set in sets {
            let key = ObjectKey::of(&set);
            self.ensure_target_namespace(key.namespace.as_deref().unwrap_or_default())
                .await?;
            self.move_machine_set(set)
                .await
                .context_with(|| format!("moving {}", key))?;
        }

        let machines: Vec<Machine> =
            list_typed(self.source.as_ref(), ListQuery::of(Gvk::of::<Machine>())).await?;
        let namespaces: BTreeSet<String> = machines
            .iter()
            .filter_map(|m| m.metadata.namespace.clone())
            .collect();
        for namespace in &namespaces {
            self.ensure_target_namespace(namespace).await?;
        }
        self.move_machines(machines).await
    }
}

/// Drop store-assigned identity so the object can be created elsewhere
fn reset_identity(obj: &mut Resource) {
    obj.clear_resource_version();
    obj.meta_mut().uid = None;
}

fn owned_by(meta: &ObjectMeta, uid: &str) -> bool {
    meta.owner_references
        .iter()
        .flatten()
        .any(|o| o.uid == uid)
}

fn owned_by_kind(meta: &ObjectMeta, kind: &str) -> bool {
    meta.owner_references
        .iter()
        .flatten()
        .any(|o| o.kind == kind)
}

/// List one kind and unwrap the typed variant
async fn list_typed<K>(store: &dyn ObjectStore, query: ListQuery) -> Result<Vec<K>>
where
    K: TryFrom<Resource>,
{
    let kind = query.gvk.as_ref().map(|g| g.kind.clone()).unwrap_or_default();
    let objects = store
        .list(&query)
        .await
        .context_with(|| format!("listing {}", kind))?;
    Ok(objects
        .into_iter()
        .filter_map(|o| K::try_from(o).ok())
        .collect())
}

/// Create in the target; an object left there by an interrupted move is kept
async fn create_in_target(target: &dyn ObjectStore, obj: &Resource) -> Result<Resource> {
    let key = obj.key();
    match target.create(obj).await {
        Ok(created) => {
            debug!(object = %key, "Created in target cluster");
            Ok(created)
        }
        Err(e) if e.is_already_exists() => {
            debug!(object = %key, "Already present in target cluster");
            target.get(&key).await.context_with(|| format!("reading {}", key))
        }
        Err(e) => Err(e.with_context(format!("creating {} in target cluster", key))),
    }
}

/// Clear finalizers, then delete
async fn force_delete(store: &dyn ObjectStore, key: &ObjectKey, propagation: Option<Propagation>) -> Result<()> {
    let mut obj = match store.get(key).await {
        Ok(obj) => obj,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e.with_context(format!("reading {}", key))),
    };

    obj.clear_finalizers();
    match store.update(&obj).await {
        Ok(_) => {}
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e.with_context(format!("removing finalizers from {}", key))),
    }

    match store.delete(key, propagation).await {
        Ok(()) => {
            debug!(object = %key, "Deleted from source cluster");
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e.with_context(format!("deleting {}", key))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tugboat_common::memory::{MemoryStore, Operation};

    const CAPI: &str = "cluster.x-k8s.io/v1alpha2";
    const INFRA: &str = "infrastructure.cluster.x-k8s.io/v1alpha2";
    const BOOTSTRAP: &str = "bootstrap.cluster.x-k8s.io/v1alpha2";

    fn obj(value: Value) -> Resource {
        Resource::from_value(value).unwrap()
    }

    fn reference(api_version: &str, kind: &str, name: &str) -> Value {
        json!({ "apiVersion": api_version, "kind": kind, "name": name })
    }

    fn owner(kind: &str, name: &str) -> Value {
        json!([{ "apiVersion": CAPI, "kind": kind, "name": name, "uid": format!("{}-uid", name), "controller": true }])
    }

    fn cluster_labels() -> Value {
        json!({ (CLUSTER_NAME_LABEL): "cluster1" })
    }

    fn infra_object(kind: &str, ns: &str, name: &str) -> Resource {
        obj(json!({
            "apiVersion": INFRA, "kind": kind,
            "metadata": { "name": name, "namespace": ns, "finalizers": ["infrastructure.cluster.x-k8s.io"] },
            "spec": { "providerID": format!("docker:///{}", name) }
        }))
    }

    fn machine(ns: &str, name: &str, owner_set: Option<&str>, node: bool) -> Vec<Resource> {
        let mut metadata = json!({ "name": name, "namespace": ns, "uid": format!("{}-uid", name),
            "finalizers": ["machine.cluster.x-k8s.io"] });
        if let Some(set) = owner_set {
            metadata["ownerReferences"] = owner("MachineSet", set);
            metadata["labels"] = cluster_labels();
        }
        let status = if node {
            json!({ "nodeRef": { "kind": "Node", "name": name } })
        } else {
            json!({})
        };
        vec![
            obj(json!({
                "apiVersion": CAPI, "kind": "Machine", "metadata": metadata,
                "spec": {
                    "bootstrap": { "configRef": reference(BOOTSTRAP, "KubeadmConfig", name) },
                    "infrastructureRef": reference(INFRA, "DockerMachine", name),
                    "version": "v1.16.3"
                },
                "status": status
            })),
            infra_object("DockerMachine", ns, name),
            obj(json!({ "apiVersion": BOOTSTRAP, "kind": "KubeadmConfig", "metadata": { "name": name, "namespace": ns } })),
        ]
    }

    fn machine_template() -> Value {
        json!({ "spec": {
            "bootstrap": { "configRef": reference(BOOTSTRAP, "KubeadmConfigTemplate", "md1-bootstrap") },
            "infrastructureRef": reference(INFRA, "DockerMachineTemplate", "md1-template"),
        }})
    }

    /// cluster1 with one MachineDeployment (two MachineSets, three Machines),
    /// plus one Machine outside any Cluster
    fn source_objects() -> Vec<Resource> {
        let mut objects = vec![
            obj(json!({
                "apiVersion": CAPI, "kind": "Cluster",
                "metadata": { "name": "cluster1", "namespace": "ns1", "uid": "cluster1-uid",
                    "finalizers": ["cluster.cluster.x-k8s.io"] },
                "spec": { "infrastructureRef": reference(INFRA, "DockerCluster", "cluster1") },
                "status": { "infrastructureReady": true }
            })),
            infra_object("DockerCluster", "ns1", "cluster1"),
            obj(json!({ "apiVersion": "v1", "kind": "Secret",
                "metadata": { "name": "cluster1-kubeconfig", "namespace": "ns1",
                    "ownerReferences": owner("Cluster", "cluster1") } })),
            obj(json!({ "apiVersion": "v1", "kind": "Secret",
                "metadata": { "name": "cluster1-ca", "namespace": "ns1" } })),
            obj(json!({ "apiVersion": "v1", "kind": "Secret",
                "metadata": { "name": "unrelated", "namespace": "ns1" } })),
            obj(json!({
                "apiVersion": CAPI, "kind": "MachineDeployment",
                "metadata": { "name": "md1", "namespace": "ns1", "uid": "md1-uid",
                    "labels": cluster_labels(), "ownerReferences": owner("Cluster", "cluster1") },
                "spec": { "replicas": 3, "template": machine_template() }
            })),
            infra_object("DockerMachineTemplate", "ns1", "md1-template"),
            obj(json!({ "apiVersion": BOOTSTRAP, "kind": "KubeadmConfigTemplate",
                "metadata": { "name": "md1-bootstrap", "namespace": "ns1" } })),
        ];
        for set in ["ms1", "ms2"] {
            objects.push(obj(json!({
                "apiVersion": CAPI, "kind": "MachineSet",
                "metadata": { "name": set, "namespace": "ns1", "uid": format!("{}-uid", set),
                    "labels": cluster_labels(), "ownerReferences": owner("MachineDeployment", "md1") },
                "spec": { "template": machine_template() }
            })));
        }
        objects.extend(machine("ns1", "m1", Some("ms1"), true));
        objects.extend(machine("ns1", "m2", Some("ms2"), true));
        objects.extend(machine("ns1", "m3", Some("ms2"), true));
        objects.extend(machine("ns2", "standalone", None, true));
        objects
    }

    fn fast() -> MoverConfig {
        MoverConfig::new()
            .with_machine_ready_interval(Duration::from_millis(1))
            .with_machine_ready_timeout(Duration::from_millis(50))
            .with_api_ready_wait(Duration::from_millis(1), Duration::from_millis(50))
    }

    fn mover(source: &Arc<MemoryStore>, target: &Arc<MemoryStore>) -> ObjectMover {
        ObjectMover::with_config(source.clone(), target.clone(), fast())
    }

    fn graph_keys(objects: &[Resource]) -> BTreeSet<ObjectKey> {
        objects
            .iter()
            .filter(|o| o.name() != "unrelated")
            .map(Resource::key)
            .collect()
    }

    // ==========================================================================
    // Story Tests: Moving a Cluster and everything hanging off it
    // ==========================================================================

    /// Story: After a pivot every graph object lives in the target only
    #[tokio::test]
    async fn story_pivot_moves_the_whole_graph() {
        let objects = source_objects();
        let expected = graph_keys(&objects);
        let source = Arc::new(MemoryStore::seeded(objects));
        let target = Arc::new(MemoryStore::new());

        mover(&source, &target).pivot().await.unwrap();

        for key in &expected {
            assert!(target.contains(key), "{} missing from target", key);
            let err = source.get(key).await.unwrap_err();
            assert!(err.is_not_found(), "{} still in source", key);
        }

        let left: Vec<String> = source.objects().iter().map(|o| o.name().to_string()).collect();
        assert_eq!(left, vec!["unrelated"]);

        for ns in ["ns1", "ns2"] {
            assert!(target.contains(&ObjectKey::cluster_scoped(Gvk::of::<Namespace>(), ns)));
        }
    }

    /// Story: Parents are created in the target before their children are
    /// deleted from the source, and Machines before their sets
    #[tokio::test]
    async fn story_pivot_order() {
        let source = Arc::new(MemoryStore::seeded(source_objects()));
        let target = Arc::new(MemoryStore::new());

        mover(&source, &target).pivot().await.unwrap();

        let created: Vec<String> = target
            .creation_order()
            .into_iter()
            .map(|k| format!("{}/{}", k.gvk.kind, k.name))
            .collect();
        let position = |s: &str| created.iter().position(|c| c == s).unwrap();

        assert_eq!(created[0], "Namespace/ns1");
        assert!(position("Cluster/cluster1") < position("DockerCluster/cluster1"));
        assert!(position("DockerCluster/cluster1") < position("Secret/cluster1-kubeconfig"));
        assert!(position("Machine/m1") < position("MachineSet/ms1"));
        assert!(position("MachineSet/ms2") < position("MachineDeployment/md1"));
        assert!(position("DockerMachineTemplate/md1-template") < position("MachineDeployment/md1"));
        assert!(position("MachineDeployment/md1") < position("Machine/standalone"));

        let deleted: Vec<String> = source
            .deletions()
            .into_iter()
            .map(|k| format!("{}/{}", k.gvk.kind, k.name))
            .collect();
        let position = |s: &str| deleted.iter().position(|c| c == s).unwrap();
        assert!(position("Machine/m1") < position("MachineSet/ms1"));
        assert!(position("MachineSet/ms2") < position("MachineDeployment/md1"));
        assert!(position("MachineDeployment/md1") < position("Cluster/cluster1"));
    }

    /// Story: Moved objects carry no stale identity; Secrets point at the new Cluster
    #[tokio::test]
    async fn story_moved_objects_are_rewired() {
        let source = Arc::new(MemoryStore::seeded(source_objects()));
        let target = Arc::new(MemoryStore::new());

        mover(&source, &target).pivot().await.unwrap();

        let objects = target.objects();
        let uids: BTreeSet<String> = objects.iter().filter_map(|o| o.meta().uid.clone()).collect();
        for o in &objects {
            for owner in o.meta().owner_references.iter().flatten() {
                assert!(uids.contains(&owner.uid), "{} owned by missing {}", o.key(), owner.uid);
            }
            assert!(o.meta().uid.as_deref().is_some_and(|u| !u.ends_with("-uid")), "{}", o.key());
        }

        let cluster = target
            .object(&ObjectKey::namespaced(Gvk::of::<Cluster>(), "ns1", "cluster1"))
            .unwrap();
        for name in ["cluster1-kubeconfig", "cluster1-ca"] {
            let secret = target
                .object(&ObjectKey::namespaced(Gvk::of::<Secret>(), "ns1", name))
                .unwrap();
            let owners = secret.meta().owner_references.clone().unwrap();
            assert_eq!(owners.len(), 1);
            assert_eq!(owners[0].kind, "Cluster");
            assert_eq!(owners[0].api_version, CAPI);
            assert_eq!(Some(&owners[0].uid), cluster.meta().uid.as_ref());
        }

        let machine = target
            .object(&ObjectKey::namespaced(Gvk::of::<Machine>(), "ns1", "m1"))
            .unwrap();
        assert!(machine.meta().owner_references.is_none());
        assert_eq!(machine.to_value().unwrap()["spec"]["version"], "v1.16.3");
    }

    /// Story: Every Secret whose name starts with the Cluster name moves,
    /// including one named exactly after the Cluster
    #[tokio::test]
    async fn story_cluster_secrets_are_matched_by_name_prefix() {
        let mut objects = source_objects();
        for name in ["cluster1", "cluster1ssh"] {
            objects.push(obj(json!({ "apiVersion": "v1", "kind": "Secret",
                "metadata": { "name": name, "namespace": "ns1" } })));
        }
        let source = Arc::new(MemoryStore::seeded(objects));
        let target = Arc::new(MemoryStore::new());

        mover(&source, &target).pivot().await.unwrap();

        for name in ["cluster1", "cluster1ssh", "cluster1-ca"] {
            let key = ObjectKey::namespaced(Gvk::of::<Secret>(), "ns1", name);
            assert!(target.contains(&key), "{} missing from target", key);
            assert!(!source.contains(&key), "{} still in source", key);
        }
        assert!(source.contains(&ObjectKey::namespaced(Gvk::of::<Secret>(), "ns1", "unrelated")));
    }

    // ==========================================================================
    // Story Tests: Failure and re-run
    // ==========================================================================

    /// Story: A Machine that never gets a node fails the move, but its
    /// siblings still land in the target
    #[tokio::test]
    async fn story_machine_timeout_reports_first_error_after_siblings() {
        let mut objects = machine("ns2", "ready", None, true);
        objects.extend(machine("ns2", "stuck", None, false));
        let source = Arc::new(MemoryStore::seeded(objects));
        let target = Arc::new(MemoryStore::new());

        let err = mover(&source, &target).pivot().await.unwrap_err();

        assert!(matches!(err.root(), Error::Timeout { .. }), "{}", err);
        assert!(err.to_string().contains("Machine ns2/stuck"), "{}", err);
        assert!(target.contains(&ObjectKey::namespaced(Gvk::of::<Machine>(), "ns2", "ready")));
        assert!(target.contains(&ObjectKey::namespaced(Gvk::of::<Machine>(), "ns2", "stuck")));
        assert!(source.get(&ObjectKey::namespaced(Gvk::of::<Machine>(), "ns2", "ready")).await.is_err());
    }

    /// Story: Re-running after an interruption tolerates objects already moved
    #[tokio::test]
    async fn story_pivot_can_be_rerun() {
        let source = Arc::new(MemoryStore::seeded(source_objects()));
        let target = Arc::new(MemoryStore::new());
        target.fail_on(Operation::Create, "MachineSet", Some("ms2"));

        let err = mover(&source, &target).pivot().await.unwrap_err();
        assert!(err.to_string().contains("MachineSet ns1/ms2"), "{}", err);

        let target = Arc::new(MemoryStore::seeded(target.objects()));
        mover(&source, &target).pivot().await.unwrap();

        assert!(target.contains(&ObjectKey::namespaced(Gvk::of::<MachineSet>(), "ns1", "ms2")));
        assert!(target.contains(&ObjectKey::namespaced(Gvk::of::<MachineDeployment>(), "ns1", "md1")));
        assert!(source.objects().iter().all(|o| o.name() == "unrelated"));
    }

    #[tokio::test]
    async fn machines_being_deleted_are_not_moved() {
        let mut objects = machine("ns2", "doomed", None, true);
        objects[0].meta_mut().deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Default::default()),
        );
        let source = Arc::new(MemoryStore::seeded(objects));
        let target = Arc::new(MemoryStore::new());

        mover(&source, &target).pivot().await.unwrap();

        assert!(!target.contains(&ObjectKey::namespaced(Gvk::of::<Machine>(), "ns2", "doomed")));
        assert!(source.contains(&ObjectKey::namespaced(Gvk::of::<Machine>(), "ns2", "doomed")));
    }

    #[tokio::test]
    async fn forbidden_namespace_lookup_falls_back_to_list() {
        let source = Arc::new(MemoryStore::seeded(source_objects()));
        let target = Arc::new(MemoryStore::seeded([obj(json!({
            "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": "ns1" }
        }))]));
        target.forbid(Operation::Get, "Namespace");
        target.forbid(Operation::Create, "Namespace");

        let err = mover(&source, &target).pivot().await.unwrap_err();
        // ns1 is found by listing, ns2 cannot be created
        assert!(err.is_forbidden(), "{}", err);
        assert!(target.contains(&ObjectKey::namespaced(Gvk::of::<Cluster>(), "ns1", "cluster1")));
        assert!(err.to_string().contains("Namespace ns2"), "{}", err);
    }

    #[tokio::test]
    async fn unreadable_missing_namespace_is_not_created() {
        let source = Arc::new(MemoryStore::seeded(source_objects()));
        let target = Arc::new(MemoryStore::new());
        target.forbid(Operation::Get, "Namespace");

        let err = mover(&source, &target).pivot().await.unwrap_err();

        assert!(err.is_forbidden(), "{}", err);
        assert!(err.to_string().contains("reading Namespace ns1"), "{}", err);
        assert!(target.creation_order().is_empty());
        assert!(source.contains(&ObjectKey::namespaced(Gvk::of::<Cluster>(), "ns1", "cluster1")));
    }

    #[tokio::test]
    async fn unreachable_cluster_api_times_out() {
        let source = Arc::new(MemoryStore::new());
        source.fail_on(Operation::List, "Cluster", None);
        let target = Arc::new(MemoryStore::new());

        let err = mover(&source, &target).pivot().await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "{}", err);
        assert!(err.to_string().contains("source"));
    }
}
