use plexus::{GroupOptions, HashStore, ProcessGroup, Store};
use std::sync::Arc;

/// Run `f` on every rank of a fresh group, one thread per rank over a
/// shared in-memory store and a loopback mesh.
pub fn run_group<F>(size: u32, f: F)
where
    F: Fn(ProcessGroup) + Send + Sync + 'static,
{
    run_group_with(size, GroupOptions::loopback(), f);
}

/// Same as [`run_group`] with explicit options. Callers build options on
/// top of [`GroupOptions::loopback`] so every rank binds on 127.0.0.1.
pub fn run_group_with<F>(size: u32, options: GroupOptions, f: F)
where
    F: Fn(ProcessGroup) + Send + Sync + 'static,
{
    let store: Arc<dyn Store> = Arc::new(HashStore::new());
    let f = Arc::new(f);
    let handles: Vec<_> = (0..size)
        .map(|rank| {
            let store = Arc::clone(&store);
            let f = Arc::clone(&f);
            let options = options.clone();
            std::thread::Builder::new()
                .name(format!("rank-{rank}"))
                .spawn(move || {
                    let group = ProcessGroup::new(store, rank, size, options)
                        .unwrap_or_else(|e| panic!("rank {rank} failed to join: {e}"));
                    f(group);
                })
                .expect("spawn rank thread")
        })
        .collect();
    for handle in handles {
        handle.join().expect("rank thread panicked");
    }
}
