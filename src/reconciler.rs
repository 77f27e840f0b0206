//! Reconciler - the device reconciliation loop
//!
//! ## Responsibilities
//!
//! - Serialize hotplug add/remove notifications against the dongle index
//! - Elect one canonical endpoint per physical modem (minimum tty wins)
//! - Keep the alias symlinks and the `is_symlinked` flags consistent
//! - Publish lifecycle events to the hub
//!
//! A physical modem enumerates several ttyUSB endpoints on attach; every
//! one of them is probed, but only the lowest-tty endpoint of an IMEI group
//! holds the `/dev` aliases. Errors never escape the dispatch handlers: a
//! failed probe, store call or symlink operation drops the current event
//! with a log line and the loop keeps serving.

use crate::error::{Error, Result};
use crate::event_hub::EventHub;
use crate::hotplug::{self, HotplugEvent, HotplugSource};
use crate::models::{Dongle, Event};
use crate::probe::Prober;
use crate::store::DongleStore;
use crate::symlink::SymlinkManager;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Orchestrates hotplug events, probing, the index and the alias pair
pub struct Reconciler<P: Prober> {
    store: DongleStore,
    events: Arc<EventHub>,
    symlinks: SymlinkManager,
    prober: Arc<P>,
    dev_dir: PathBuf,
}

impl<P: Prober> Reconciler<P> {
    pub fn new(
        store: DongleStore,
        events: Arc<EventHub>,
        symlinks: SymlinkManager,
        prober: Arc<P>,
        dev_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            events,
            symlinks,
            prober,
            dev_dir: dev_dir.into(),
        }
    }

    /// Startup pass: purge stale aliases, then reconcile every device that
    /// was already attached when the daemon came up.
    ///
    /// Probes run one at a time so that startup is deterministic; a probe
    /// failure is logged and does not abort the remaining devices.
    pub async fn startup<S: HotplugSource>(&self, source: &S) -> Result<()> {
        self.symlinks.purge_all()?;

        for ev in source.enumerate()? {
            let node = hotplug::device_node(&self.dev_dir, &ev.devpath);
            if !hotplug::is_usb_serial(&node) {
                continue;
            }
            info!(path = %node.display(), "found existing device");
            if let Err(e) = self.on_add(&ev).await {
                warn!(path = %node.display(), error = %e, "startup reconciliation failed");
            }
        }
        Ok(())
    }

    /// Consume the hotplug stream until the token cancels it.
    ///
    /// Cancellation closes the source's channel; the loop drains what is
    /// left and returns. An in-flight probe is bounded by its own timeout.
    pub async fn run<S: HotplugSource>(&self, source: &S, cancel: CancellationToken) -> Result<()> {
        info!("running the device manager");
        let mut stream = source.subscribe(cancel)?;

        while let Some(ev) = stream.recv().await {
            let node = hotplug::device_node(&self.dev_dir, &ev.devpath);
            match ev.action.as_str() {
                "add" => {
                    info!(path = %node.display(), "received add event");
                    if let Err(e) = self.on_add(&ev).await {
                        error!(path = %node.display(), error = %e, "add failed");
                    }
                }
                "remove" => {
                    info!(path = %node.display(), "received remove event");
                    let path = node.to_string_lossy();
                    if let Err(e) = self.on_remove(&path).await {
                        error!(path = %path, error = %e, "remove failed");
                    }
                }
                _ => {}
            }
        }

        info!("device manager stopped");
        Ok(())
    }

    /// Handle one add notification.
    ///
    /// Non-ttyUSB nodes are ignored. The endpoint is probed for its
    /// identity, then raced against the current best candidate of its IMEI
    /// group: a lower-tty incumbent wins and the new endpoint is skipped; a
    /// higher-tty incumbent is displaced by the newcomer.
    async fn on_add(&self, ev: &HotplugEvent) -> Result<()> {
        let node = hotplug::device_node(&self.dev_dir, &ev.devpath);
        if !hotplug::is_usb_serial(&node) {
            return Ok(());
        }
        let path = node.to_string_lossy().into_owned();
        let tty = hotplug::tty_number(&node)?;

        debug!(path = %path, "looking for modem");
        let report = {
            let prober = self.prober.clone();
            let path = path.clone();
            tokio::task::spawn_blocking(move || prober.probe(&path))
                .await
                .map_err(|e| Error::Internal(e.to_string()))??
        };

        let mut candidate = Dongle::new(report.imei, report.imsi, path, tty);
        candidate.properties = ev.properties.clone();

        match self.store.best_candidate(&candidate.imei).await? {
            None => {
                if self.store.exists(&candidate.imei, &candidate.path).await? {
                    debug!(path = %candidate.path, "dongle already tracked");
                    return Ok(());
                }
                self.announce_and_install(candidate, None).await
            }
            Some(best) if best.tty < candidate.tty => {
                info!(
                    existing = %best.path,
                    candidate = %candidate.path,
                    "a better candidate already exists"
                );
                Ok(())
            }
            Some(best) => self.announce_and_install(candidate, Some(best)).await,
        }
    }

    /// Publish the add, then persist and take the aliases when a SIM is
    /// present. The add event goes out before the insert, so subscribers
    /// can observe a dongle that never gets persisted.
    async fn announce_and_install(
        &self,
        candidate: Dongle,
        displaced: Option<Dongle>,
    ) -> Result<()> {
        info!(
            imei = %candidate.imei,
            imsi = %candidate.imsi,
            path = %candidate.path,
            "found dongle"
        );
        self.events.publish(Event::add(candidate.clone())).await;

        if candidate.imsi.is_empty() {
            info!(path = %candidate.path, "skipping dongle without imsi");
            return Ok(());
        }

        let stored = self.store.insert(&candidate).await?;
        let updated = self.symlinks.install(&stored, &self.store).await?;

        // Exactly one record per IMEI group holds the flag: the displaced
        // incumbent loses it when the newcomer takes the aliases.
        if let Some(mut previous) = displaced {
            if previous.is_symlinked && previous.path != updated.path {
                previous.is_symlinked = false;
                self.store.update(&previous).await?;
            }
        }

        self.events.publish(Event::update(updated)).await;
        Ok(())
    }

    /// Handle one remove notification.
    ///
    /// Paths the index never knew about are silently ignored. When any
    /// endpoint of a tracked group disappears, the group's best candidate
    /// record is deleted and its aliases torn down; the surviving sibling
    /// records stay until their own remove events, and a later add installs
    /// the aliases afresh.
    async fn on_remove(&self, path: &str) -> Result<()> {
        let Some(d) = self.store.get(path).await? else {
            return Ok(());
        };

        match self.store.best_candidate(&d.imei).await? {
            None => {
                self.events.publish(Event::remove(d.clone())).await;
                self.store.remove(&d).await?;
                info!(imei = %d.imei, path = %d.path, "removed dongle");
            }
            Some(candidate) => {
                self.store.remove(&candidate).await?;
                self.symlinks.remove(&candidate);
                self.events.publish(Event::remove(candidate.clone())).await;
                info!(
                    imei = %candidate.imei,
                    path = %candidate.path,
                    "removed dongle group candidate"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProbeError;
    use crate::models::EventName;
    use crate::probe::ProbeReport;
    use std::collections::HashMap;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    /// Prober answering from a script of path -> identity
    struct ScriptedProber {
        replies: Mutex<HashMap<String, std::result::Result<(String, String), ()>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedProber {
        fn new() -> Self {
            Self {
                replies: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn modem(&self, path: &str, imei: &str, imsi: &str) {
            self.replies
                .lock()
                .unwrap()
                .insert(path.to_string(), Ok((imei.to_string(), imsi.to_string())));
        }

        fn broken(&self, path: &str) {
            self.replies
                .lock()
                .unwrap()
                .insert(path.to_string(), Err(()));
        }
    }

    impl Prober for ScriptedProber {
        fn probe(&self, path: &str) -> std::result::Result<ProbeReport, ProbeError> {
            self.calls.lock().unwrap().push(path.to_string());
            match self.replies.lock().unwrap().get(path) {
                Some(Ok((imei, imsi))) => Ok(ProbeReport {
                    imei: imei.clone(),
                    imsi: imsi.clone(),
                    ati: format!("IMEI: {imei} +GCAP OK"),
                }),
                Some(Err(())) => Err(ProbeError::ParseImei),
                None => Err(ProbeError::PortOpen(serialport::Error::new(
                    serialport::ErrorKind::NoDevice,
                    "no scripted modem",
                ))),
            }
        }
    }

    /// Hotplug source replaying fixed notification lists
    struct StaticSource {
        initial: Vec<HotplugEvent>,
        live: Mutex<Vec<HotplugEvent>>,
    }

    impl StaticSource {
        fn new(initial: Vec<HotplugEvent>, live: Vec<HotplugEvent>) -> Self {
            Self {
                initial,
                live: Mutex::new(live),
            }
        }
    }

    impl HotplugSource for StaticSource {
        fn enumerate(&self) -> Result<Vec<HotplugEvent>> {
            Ok(self.initial.clone())
        }

        fn subscribe(&self, _cancel: CancellationToken) -> Result<mpsc::Receiver<HotplugEvent>> {
            let events = std::mem::take(&mut *self.live.lock().unwrap());
            let (tx, rx) = mpsc::channel(events.len().max(1));
            for ev in events {
                tx.try_send(ev).unwrap();
            }
            Ok(rx)
        }
    }

    struct Fixture {
        dev: TempDir,
        store: DongleStore,
        prober: Arc<ScriptedProber>,
        reconciler: Reconciler<ScriptedProber>,
        rx: mpsc::UnboundedReceiver<Event>,
        _subscriber: Uuid,
    }

    impl Fixture {
        async fn new() -> Self {
            let dev = TempDir::new().unwrap();
            let store = DongleStore::connect("sqlite::memory:").await.unwrap();
            let events = Arc::new(EventHub::new());
            let prober = Arc::new(ScriptedProber::new());
            let reconciler = Reconciler::new(
                store.clone(),
                events.clone(),
                SymlinkManager::new(dev.path()),
                prober.clone(),
                dev.path(),
            );
            let (id, rx) = events.subscribe().await;
            Self {
                dev,
                store,
                prober,
                reconciler,
                rx,
                _subscriber: id,
            }
        }

        fn node(&self, name: &str) -> String {
            self.dev.path().join(name).to_string_lossy().into_owned()
        }

        fn hotplug(&self, action: &str, name: &str) -> HotplugEvent {
            let mut properties = HashMap::new();
            properties.insert("ID_BUS".to_string(), "usb".to_string());
            HotplugEvent {
                action: action.to_string(),
                devpath: format!("/devices/pci0000:00/usb1/1-1/{name}/tty/{name}"),
                properties,
            }
        }

        async fn add(&self, name: &str) -> Result<()> {
            self.reconciler.on_add(&self.hotplug("add", name)).await
        }

        async fn remove(&self, name: &str) -> Result<()> {
            self.reconciler.on_remove(&self.node(name)).await
        }

        fn drain(&mut self) -> Vec<Event> {
            let mut out = Vec::new();
            while let Ok(ev) = self.rx.try_recv() {
                out.push(ev);
            }
            out
        }

        fn read_alias(&self, alias: &str) -> Option<String> {
            fs::read_link(self.dev.path().join(alias))
                .ok()
                .map(|t| t.to_string_lossy().into_owned())
        }
    }

    #[tokio::test]
    async fn single_modem_happy_path() {
        let mut fx = Fixture::new().await;
        fx.prober.modem(&fx.node("ttyUSB0"), "111", "222");

        fx.add("ttyUSB0").await.unwrap();

        let events = fx.drain();
        assert_eq!(events[0].name, EventName::Add);
        assert_eq!(events[0].data.imei, "111");
        assert_eq!(events[1].name, EventName::Update);
        assert!(events[1].data.is_symlinked);

        let stored = fx.store.get(&fx.node("ttyUSB0")).await.unwrap().unwrap();
        assert_eq!(stored.tty, 0);
        assert!(stored.is_symlinked);
        assert_eq!(stored.properties.get("ID_BUS").unwrap(), "usb");

        assert_eq!(fx.read_alias("111.imei").unwrap(), fx.node("ttyUSB0"));
        assert_eq!(fx.read_alias("222.imsi").unwrap(), fx.node("ttyUSB0"));
    }

    #[tokio::test]
    async fn lowest_tty_wins_the_tie_break() {
        let mut fx = Fixture::new().await;
        for name in ["ttyUSB2", "ttyUSB1", "ttyUSB0"] {
            fx.prober.modem(&fx.node(name), "A1", "Z9");
        }

        fx.add("ttyUSB2").await.unwrap();
        fx.add("ttyUSB1").await.unwrap();
        fx.add("ttyUSB0").await.unwrap();

        let all = fx.store.list_all().await.unwrap();
        assert_eq!(all.len(), 3);
        for d in &all {
            assert_eq!(d.is_symlinked, d.path == fx.node("ttyUSB0"), "{}", d.path);
        }

        assert_eq!(fx.read_alias("A1.imei").unwrap(), fx.node("ttyUSB0"));
        assert_eq!(fx.read_alias("Z9.imsi").unwrap(), fx.node("ttyUSB0"));
        fx.drain();
    }

    #[tokio::test]
    async fn higher_tty_does_not_displace_the_winner() {
        let mut fx = Fixture::new().await;
        fx.prober.modem(&fx.node("ttyUSB0"), "A1", "Z9");
        fx.prober.modem(&fx.node("ttyUSB2"), "A1", "Z9");

        fx.add("ttyUSB0").await.unwrap();
        fx.drain();
        fx.add("ttyUSB2").await.unwrap();

        // the dominated endpoint is skipped entirely: no events, no record
        assert!(fx.drain().is_empty());
        assert!(fx.store.get(&fx.node("ttyUSB2")).await.unwrap().is_none());
        assert_eq!(fx.read_alias("A1.imei").unwrap(), fx.node("ttyUSB0"));
    }

    #[tokio::test]
    async fn removing_the_winner_tears_down_the_aliases() {
        let mut fx = Fixture::new().await;
        for name in ["ttyUSB2", "ttyUSB1", "ttyUSB0"] {
            fx.prober.modem(&fx.node(name), "A1", "Z9");
            fx.add(name).await.unwrap();
        }
        fx.drain();

        fx.remove("ttyUSB0").await.unwrap();

        let events = fx.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, EventName::Remove);
        assert_eq!(events[0].data.path, fx.node("ttyUSB0"));

        assert!(fx.read_alias("A1.imei").is_none());
        assert!(fx.read_alias("Z9.imsi").is_none());

        let remaining = fx.store.list_all().await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|d| !d.is_symlinked));
    }

    // Removing any member of a group deletes the group's best candidate,
    // not the record whose path was unplugged. Surprising, but deliberate;
    // the aliases come back on the next add.
    #[tokio::test]
    async fn removing_a_member_tears_down_the_group_winner() {
        let mut fx = Fixture::new().await;
        for name in ["ttyUSB2", "ttyUSB1", "ttyUSB0"] {
            fx.prober.modem(&fx.node(name), "A1", "Z9");
            fx.add(name).await.unwrap();
        }
        fx.drain();

        fx.remove("ttyUSB2").await.unwrap();

        let events = fx.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, EventName::Remove);
        assert_eq!(events[0].data.path, fx.node("ttyUSB0"));

        assert!(fx.store.get(&fx.node("ttyUSB0")).await.unwrap().is_none());
        assert!(fx.store.get(&fx.node("ttyUSB2")).await.unwrap().is_some());
        assert!(fx.read_alias("A1.imei").is_none());
    }

    #[tokio::test]
    async fn missing_sim_announces_but_never_persists() {
        let mut fx = Fixture::new().await;
        fx.prober.modem(&fx.node("ttyUSB0"), "111", "");

        fx.add("ttyUSB0").await.unwrap();

        let events = fx.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, EventName::Add);
        assert_eq!(events[0].data.imsi, "");

        assert!(fx.store.list_all().await.unwrap().is_empty());
        assert!(fx.read_alias("111.imei").is_none());
    }

    #[tokio::test]
    async fn probe_failure_drops_the_event_and_the_loop_continues() {
        let mut fx = Fixture::new().await;
        fx.prober.broken(&fx.node("ttyUSB0"));
        fx.prober.modem(&fx.node("ttyUSB1"), "111", "222");

        assert!(fx.add("ttyUSB0").await.is_err());
        assert!(fx.drain().is_empty());
        assert!(fx.store.list_all().await.unwrap().is_empty());

        // subsequent events are still served
        fx.add("ttyUSB1").await.unwrap();
        assert_eq!(fx.store.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn startup_purges_stale_aliases_first() {
        let fx = Fixture::new().await;
        fs::write(fx.dev.path().join("stale.imei"), b"").unwrap();
        fs::write(fx.dev.path().join("stale.imsi"), b"").unwrap();

        let source = StaticSource::new(Vec::new(), Vec::new());
        fx.reconciler.startup(&source).await.unwrap();

        assert!(!fx.dev.path().join("stale.imei").exists());
        assert!(!fx.dev.path().join("stale.imsi").exists());
    }

    #[tokio::test]
    async fn startup_reconciles_devices_already_attached() {
        let fx = Fixture::new().await;
        fx.prober.modem(&fx.node("ttyUSB0"), "111", "222");

        let source = StaticSource::new(
            vec![
                fx.hotplug("add", "ttyUSB0"),
                // non-serial devices in the enumeration are skipped
                fx.hotplug("add", "sda1"),
            ],
            Vec::new(),
        );
        fx.reconciler.startup(&source).await.unwrap();

        assert!(fx.store.get(&fx.node("ttyUSB0")).await.unwrap().is_some());
        assert_eq!(fx.prober.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn startup_probe_failure_does_not_abort_startup() {
        let fx = Fixture::new().await;
        fx.prober.broken(&fx.node("ttyUSB0"));
        fx.prober.modem(&fx.node("ttyUSB1"), "111", "222");

        let source = StaticSource::new(
            vec![fx.hotplug("add", "ttyUSB0"), fx.hotplug("add", "ttyUSB1")],
            Vec::new(),
        );
        fx.reconciler.startup(&source).await.unwrap();

        assert!(fx.store.get(&fx.node("ttyUSB0")).await.unwrap().is_none());
        assert!(fx.store.get(&fx.node("ttyUSB1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn run_dispatches_until_the_stream_closes() {
        let fx = Fixture::new().await;
        fx.prober.modem(&fx.node("ttyUSB0"), "111", "222");

        let source = StaticSource::new(
            Vec::new(),
            vec![
                fx.hotplug("add", "ttyUSB0"),
                fx.hotplug("change", "ttyUSB0"), // ignored action
                fx.hotplug("remove", "ttyUSB0"),
            ],
        );
        fx.reconciler
            .run(&source, CancellationToken::new())
            .await
            .unwrap();

        assert!(fx.store.list_all().await.unwrap().is_empty());
        assert!(fx.read_alias("111.imei").is_none());
    }

    #[tokio::test]
    async fn unknown_remove_is_a_silent_no_op() {
        let mut fx = Fixture::new().await;
        fx.remove("ttyUSB7").await.unwrap();
        assert!(fx.drain().is_empty());
    }

    #[tokio::test]
    async fn duplicate_add_for_known_winner_does_not_duplicate() {
        let mut fx = Fixture::new().await;
        fx.prober.modem(&fx.node("ttyUSB0"), "111", "222");

        fx.add("ttyUSB0").await.unwrap();
        fx.drain();

        // re-adding the stored winner path trips the unique path index
        let err = fx.add("ttyUSB0").await.unwrap_err();
        assert!(matches!(err, Error::DuplicatePath(_)));
        assert_eq!(fx.store.list_all().await.unwrap().len(), 1);
    }
}
