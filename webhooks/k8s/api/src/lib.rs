#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;

pub use self::labels::{Labels, Selector};
pub use k8s_openapi::{
    api::{
        self,
        apps::v1::{Deployment, ReplicaSet},
        autoscaling::v1::HorizontalPodAutoscaler,
        core::v1::{
            Affinity, ConfigMap, Namespace, NodeAffinity, ObjectReference, Pod,
            PodAffinityTerm, PodAntiAffinity, PodSpec, WeightedPodAffinityTerm,
        },
        networking::v1::Ingress,
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference},
};
pub use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt},
    runtime::{reflector::ObjectRef, watcher},
    Client, Error, Resource,
};
