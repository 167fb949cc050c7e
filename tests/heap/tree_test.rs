/*!
 * Heap Tree Tests
 * Containment lookup, current-heap context, and independent heaps
 */

use heaptree::{Arena, HeapMgr, HeapOptions};
use pretty_assertions::assert_eq;

fn mgr() -> HeapMgr {
    HeapMgr::new(256 * 1024)
}

#[test]
fn test_find_contain_heap_returns_deepest() {
    let mgr = mgr();
    let root = mgr
        .create_root_heap(HeapOptions::named("root").with_size(128 * 1024))
        .unwrap();
    let child = root
        .create_child(HeapOptions::named("child").with_size(32 * 1024))
        .unwrap();
    let sibling = root
        .create_child(HeapOptions::named("sibling").with_size(32 * 1024))
        .unwrap();
    let grandchild = child
        .create_child(HeapOptions::named("grandchild").with_size(8 * 1024))
        .unwrap();

    let addr = grandchild.try_alloc(64).unwrap();
    let found = mgr.find_contain_heap(addr).expect("address must be found");
    assert_eq!(found.id(), grandchild.id());
    assert_ne!(found.id(), child.id());
    assert_ne!(found.id(), sibling.id());
    assert_ne!(found.id(), root.id());
}

#[test]
fn test_find_contain_heap_for_parent_own_allocation() {
    let mgr = mgr();
    let root = mgr
        .create_root_heap(HeapOptions::named("root").with_size(64 * 1024))
        .unwrap();
    let _child = root
        .create_child(HeapOptions::named("child").with_size(16 * 1024))
        .unwrap();
    // A block allocated from the root itself resolves to the root, not
    // to the child carved next to it.
    let addr = root.try_alloc(64).unwrap();
    let found = mgr.find_contain_heap(addr).unwrap();
    assert_eq!(found.id(), root.id());
}

#[test]
fn test_find_contain_heap_miss() {
    let mgr = mgr();
    let _root = mgr
        .create_root_heap(HeapOptions::named("root").with_size(4096))
        .unwrap();
    assert!(mgr.find_contain_heap(3).is_none());
}

#[test]
fn test_destroyed_heap_leaves_lookup() {
    let mgr = mgr();
    let root = mgr
        .create_root_heap(HeapOptions::named("root").with_size(64 * 1024))
        .unwrap();
    let child = root
        .create_child(HeapOptions::named("child").with_size(16 * 1024))
        .unwrap();
    let probe = child.region_start();
    assert_eq!(mgr.find_contain_heap(probe).unwrap().id(), child.id());

    child.destroy();
    // The address now belongs to the root's free space.
    assert_eq!(mgr.find_contain_heap(probe).unwrap().id(), root.id());
}

#[test]
fn test_independent_heap_lookup_after_roots() {
    let mgr = mgr();
    let _root = mgr
        .create_root_heap(HeapOptions::named("root").with_size(4096))
        .unwrap();
    let indep = mgr.create_independent_heap(
        Arena::with_size(8 * 1024),
        HeapOptions::named("indep"),
    );
    let addr = indep.try_alloc(128).unwrap();
    let found = mgr.find_contain_heap(addr).unwrap();
    assert_eq!(found.id(), indep.id());
}

#[test]
fn test_independent_heap_outside_root_descent() {
    let mgr = mgr();
    let root = mgr
        .create_root_heap(HeapOptions::named("root").with_size(4096))
        .unwrap();
    let indep = mgr.create_independent_heap(
        Arena::with_size(8 * 1024),
        HeapOptions::named("indep"),
    );
    assert!(!root.is_include(indep.region_start()));
    assert!(!mgr.arena_is_include(indep.region_start()));
    indep.destroy();
}

#[test]
fn test_current_heap_scoping() {
    let mgr = mgr();
    let outer = mgr
        .create_root_heap(HeapOptions::named("outer").with_size(32 * 1024))
        .unwrap();
    let inner = mgr
        .create_root_heap(HeapOptions::named("inner").with_size(32 * 1024))
        .unwrap();

    assert!(mgr.current_heap().is_none());
    {
        let _outer_scope = mgr.scoped_current_heap(&outer);
        assert_eq!(mgr.current_heap().unwrap().id(), outer.id());
        {
            let _inner_scope = mgr.scoped_current_heap(&inner);
            assert_eq!(mgr.current_heap().unwrap().id(), inner.id());
        }
        // Previous current heap restored when the scope ends.
        assert_eq!(mgr.current_heap().unwrap().id(), outer.id());
    }
    assert!(mgr.current_heap().is_none());
}

#[test]
fn test_create_heap_uses_current_when_parent_is_none() {
    let mgr = mgr();
    let root = mgr
        .create_root_heap(HeapOptions::named("root").with_size(64 * 1024))
        .unwrap();

    let _scope = mgr.scoped_current_heap(&root);
    let child = mgr
        .create_heap(None, HeapOptions::named("implicit").with_size(8 * 1024))
        .unwrap();
    assert_eq!(root.child_count(), 1);
    assert!(root.is_include(child.region_start()));
}

#[test]
fn test_create_heap_without_current_fails() {
    let mgr = mgr();
    let err = mgr
        .create_heap(None, HeapOptions::named("orphan").with_size(1024))
        .unwrap_err();
    assert!(matches!(err, heaptree::HeapError::NoCurrentHeap));
}

#[test]
fn test_current_heap_is_thread_local() {
    let mgr = mgr();
    let heap = mgr
        .create_root_heap(HeapOptions::named("main").with_size(4096))
        .unwrap();
    let _scope = mgr.scoped_current_heap(&heap);

    let mgr2 = mgr.clone();
    std::thread::spawn(move || {
        // Another thread sees no current heap.
        assert!(mgr2.current_heap().is_none());
    })
    .join()
    .unwrap();

    assert_eq!(mgr.current_heap().unwrap().id(), heap.id());
}

#[test]
fn test_multiple_named_root_heaps() {
    let mgr = mgr();
    let sys = mgr
        .create_root_heap(HeapOptions::named("system").with_size(32 * 1024))
        .unwrap();
    let gfx = mgr
        .create_root_heap(HeapOptions::named("graphics").with_size(32 * 1024))
        .unwrap();
    assert_eq!(mgr.root_heap_count(), 2);
    assert_eq!(mgr.root_heap(0).unwrap().name(), "system");
    assert_eq!(mgr.root_heap(1).unwrap().name(), "graphics");
    assert!(mgr.root_heap(2).is_none());
    // Roots are disjoint.
    assert!(!sys.is_include(gfx.region_start()));
}

#[test]
fn test_stats_walks_whole_tree() {
    let mgr = mgr();
    let root = mgr
        .create_root_heap(HeapOptions::named("root").with_size(64 * 1024))
        .unwrap();
    let _child = root
        .create_child(HeapOptions::named("child").with_size(16 * 1024))
        .unwrap();
    let _indep = mgr.create_independent_heap(
        Arena::with_size(4096),
        HeapOptions::named("indep"),
    );
    let stats = mgr.stats();
    let names: Vec<_> = stats.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["root", "child", "indep"]);
}
