//! Registry and watcher tests against real namespaces.

use std::sync::{Arc, Mutex};

use nlmirror::namespace::{DEFAULT_NAMESPACE, Namespace};
use nlmirror::{
    Dataplane, DataplaneId, Interface, NamespaceWatcher, NoDataplane, Registry, RegistryConfig,
    Result,
};

use crate::common::{TestNamespace, wait_for};

#[derive(Default)]
struct Moves(Mutex<Vec<(String, String, String)>>);

impl Dataplane for Moves {
    fn interface_moved(&self, intf: &Interface, from: &str, to: &Namespace) {
        self.0
            .lock()
            .unwrap()
            .push((intf.name.clone(), from.to_string(), to.name().to_string()));
    }
}

#[tokio::test]
async fn test_add_dumps_interfaces() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("reg")?;
    ns.add_dummy("dummy0")?;

    let registry = Registry::new(RegistryConfig::default(), Arc::new(NoDataplane));
    registry.start().await?;
    let entry = registry.add(ns.name()).await?;

    assert!(wait_for(|| entry.dump_done()).await);
    assert!(entry.interface_by_name("lo").is_some());
    assert!(entry.interface_by_name("dummy0").is_some());
    assert!(entry.packet_fd().is_some());
    assert_ne!(entry.index(), registry.namespace(DEFAULT_NAMESPACE).unwrap().index());

    registry.del(ns.name())?;
    assert!(registry.namespace(ns.name()).is_none());
    assert!(entry.packet_fd().is_none());
    registry.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_rename_and_delete_followed() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("rename")?;
    let registry = Registry::new(RegistryConfig::default(), Arc::new(NoDataplane));
    let entry = registry.add_with_nsid(ns.name(), None).await?;
    assert!(wait_for(|| entry.dump_done()).await);

    ns.add_dummy("dummy0")?;
    assert!(wait_for(|| entry.interface_by_name("dummy0").is_some()).await);
    let index = entry.interface_by_name("dummy0").unwrap().index;

    ns.rename_link("dummy0", "dummy9")?;
    assert!(wait_for(|| entry.interface_by_name("dummy9").is_some()).await);
    assert!(entry.interface_by_name("dummy0").is_none());
    assert_eq!(entry.interface(index).unwrap().name, "dummy9");

    ns.del_link("dummy9")?;
    assert!(wait_for(|| entry.interface(index).is_none()).await);
    registry.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_bound_interface_move_reported() -> Result<()> {
    require_root!();

    let red = TestNamespace::new("red")?;
    let blue = TestNamespace::new("blue")?;
    red.add_dummy("tapx0")?;

    let moves = Arc::new(Moves::default());
    let registry = Registry::new(RegistryConfig::default(), moves.clone());
    registry.bind_interface("tapx0", DataplaneId(4));
    let red_entry = registry.add_with_nsid(red.name(), None).await?;
    let blue_entry = registry.add_with_nsid(blue.name(), None).await?;
    assert!(wait_for(|| red_entry.dump_done() && blue_entry.dump_done()).await);

    red.move_link("tapx0", &blue)?;
    assert!(wait_for(|| !moves.0.lock().unwrap().is_empty()).await);

    let recorded = moves.0.lock().unwrap().clone();
    assert_eq!(
        recorded[0],
        (
            "tapx0".to_string(),
            red.name().to_string(),
            blue.name().to_string()
        )
    );
    let moved = blue_entry.interface_by_name("tapx0").unwrap();
    assert_eq!(moved.dataplane, Some(DataplaneId(4)));
    registry.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_initial_sync_after_scan() -> Result<()> {
    require_root!();

    let _ns = TestNamespace::new("sync")?;
    let registry = Registry::new(RegistryConfig::default(), Arc::new(NoDataplane));
    registry.start().await?;
    NamespaceWatcher::new(registry.clone()).scan().await?;

    tokio::time::timeout(std::time::Duration::from_secs(10), registry.initial_sync())
        .await
        .expect("initial sync should complete")?;
    assert!(registry.is_synced());
    registry.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_watcher_registers_new_namespace() -> Result<()> {
    require_root!();

    let registry = Registry::new(RegistryConfig::default(), Arc::new(NoDataplane));
    registry.start().await?;
    let watcher = NamespaceWatcher::new(registry.clone());
    let events = watcher.watch()?;
    let task = tokio::spawn(async move {
        let _ = watcher.follow(events).await;
    });

    let ns = TestNamespace::new("watch")?;
    assert!(wait_for(|| registry.namespace(ns.name()).is_some()).await);
    let entry = registry.namespace(ns.name()).unwrap();
    assert!(wait_for(|| entry.dump_done()).await);

    task.abort();
    registry.shutdown();
    Ok(())
}
