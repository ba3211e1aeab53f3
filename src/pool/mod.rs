pub(crate) mod allocator;
pub(crate) mod arena;
pub(crate) mod chunk;
pub(crate) mod chunk_list;
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod integration;
pub(crate) mod metrics;
pub(crate) mod queue;
pub(crate) mod size_class;
pub(crate) mod subpage;
pub(crate) mod thread_cache;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
