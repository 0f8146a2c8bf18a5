//! Builders for the Kubernetes objects managed on behalf of an App

pub mod deployment_builder;
