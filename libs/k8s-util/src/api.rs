use std::fmt::Debug;

use kube::api::{Api, DeleteParams, Preconditions};
use kube::Resource;
use serde::de::DeserializeOwned;

/// Last path segment of a type name, for logs and metric labels.
pub fn short_type_name<K>() -> Option<&'static str> {
    let type_name = std::any::type_name::<K>();
    type_name.split("::").last()
}

/// Get that maps 404 to `None` instead of an error.
pub async fn get_opt<K>(api: &Api<K>, name: &str) -> kube::Result<Option<K>>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e),
    }
}

/// Delete guarded by UID so a newer object reusing the name is never
/// touched. A 404 or a failed precondition both count as success: the object
/// we meant to delete is gone either way.
pub async fn delete_with_uid<K>(api: &Api<K>, name: &str, uid: &str) -> kube::Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let params = DeleteParams {
        preconditions: Some(Preconditions {
            uid: Some(uid.to_owned()),
            resource_version: None,
        }),
        ..DeleteParams::default()
    };
    match api.delete(name, &params).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 || ae.code == 409 => Ok(()),
        Err(e) => Err(e),
    }
}
