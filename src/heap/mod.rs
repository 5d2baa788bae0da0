pub(crate) mod api;
pub(crate) mod arena;
pub(crate) mod arenas;
pub(crate) mod base;
pub(crate) mod chunk_cache;
pub(crate) mod classes;
pub(crate) mod huge;
pub(crate) mod integration;
pub(crate) mod loom_tests;
pub(crate) mod map;
pub(crate) mod options;
pub(crate) mod radix;
pub(crate) mod stats;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::loom_static! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
