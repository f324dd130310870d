mod registry_ops;
mod rotation_sync;
mod support;
