//! l2mond - link-layer monitoring daemon.
//!
//! Wires the monitoring core together: socket scheduler, RTNETLINK
//! watcher and nl80211 driver, brought up through the subsystem
//! registry and driven until SIGINT/SIGTERM.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use tracing::{info, warn};

use l2mon::ifmap::{Interface, InterfaceRegistry};
use l2mon::layer2::Layer2Registry;
use l2mon::nl80211::{Nl80211Config, Nl80211Driver};
use l2mon::rtnl::RtnlWatcher;
use l2mon::util::ifname;
use l2mon::{Core, Subsystem, SubsystemRegistry};

#[derive(Parser)]
#[command(name = "l2mond", version, about = "Link-layer monitoring daemon")]
struct Cli {
    /// Interval between two link-layer information updates, in
    /// milliseconds (minimum 100).
    #[arg(long, default_value_t = 1000)]
    interval: u64,

    /// Interface to observe; repeat for multiple interfaces.
    #[arg(short = 'i', long = "interface")]
    interfaces: Vec<String>,

    /// Exit after this many milliseconds instead of running until a
    /// signal arrives.
    #[arg(long)]
    run_for: Option<u64>,
}

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signal: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

/// Brings up the RTNETLINK watcher and keeps interface transitions
/// visible in the log.
struct RtnlSubsystem {
    core: Rc<Core>,
    watcher: RefCell<Option<Rc<RtnlWatcher>>>,
}

impl Subsystem for RtnlSubsystem {
    fn name(&self) -> &'static str {
        "rtnl"
    }

    fn init(&self) -> l2mon::Result<()> {
        let watcher = RtnlWatcher::new(&self.core)?;
        watcher.listener_add(Box::new(|if_index, went_down| {
            info!(
                if_index,
                state = if went_down { "down" } else { "up" },
                "interface state changed"
            );
        }));
        *self.watcher.borrow_mut() = Some(watcher);
        Ok(())
    }

    fn cleanup(&self) {
        if let Some(watcher) = self.watcher.borrow_mut().take() {
            watcher.close();
        }
    }
}

/// Brings up the nl80211 driver.
struct Nl80211Subsystem {
    core: Rc<Core>,
    interfaces: Rc<InterfaceRegistry>,
    layer2: Rc<RefCell<Layer2Registry>>,
    config: Nl80211Config,
    driver: RefCell<Option<Rc<Nl80211Driver>>>,
}

impl Subsystem for Nl80211Subsystem {
    fn name(&self) -> &'static str {
        "nl80211"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["rtnl"]
    }

    fn init(&self) -> l2mon::Result<()> {
        let driver = Nl80211Driver::new(&self.core, &self.interfaces, &self.layer2, &self.config)?;
        *self.driver.borrow_mut() = Some(driver);
        Ok(())
    }

    fn cleanup(&self) {
        if let Some(driver) = self.driver.borrow_mut().take() {
            driver.close();
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    let sigint = handle_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, sigint as libc::sighandler_t);
        libc::signal(libc::SIGTERM, sigint as libc::sighandler_t);
    }

    let core = Core::new();
    let interfaces = Rc::new(InterfaceRegistry::new());
    let layer2 = Rc::new(RefCell::new(Layer2Registry::new()));
    let config = Nl80211Config {
        interval_ms: cli.interval,
        interfaces: cli.interfaces,
    };

    for name in &config.interfaces {
        match ifname::name_to_index(name) {
            Ok(index) => {
                let mac = ifname::hardware_address(name).ok();
                if mac.is_none() {
                    warn!(interface = %name, "no hardware address, station data will be skipped");
                }
                if let Err(err) = interfaces.add(Interface {
                    name: name.clone(),
                    index,
                    mac,
                }) {
                    warn!(interface = %name, "not observing interface: {}", err);
                }
            }
            Err(err) => warn!(interface = %name, "not observing interface: {}", err),
        }
    }

    let registry = SubsystemRegistry::new();
    registry.register(Rc::new(RtnlSubsystem {
        core: core.clone(),
        watcher: RefCell::new(None),
    }));
    registry.register(Rc::new(Nl80211Subsystem {
        core: core.clone(),
        interfaces: interfaces.clone(),
        layer2: layer2.clone(),
        config,
        driver: RefCell::new(None),
    }));
    registry.init_all()?;

    info!(
        observed = interfaces.len(),
        "l2mond started, entering event loop"
    );
    let deadline = cli.run_for.map(|ms| core.clock.absolute(ms));
    let result = core.run(|| STOP.load(Ordering::SeqCst), deadline);

    registry.cleanup_all();
    result?;
    Ok(())
}
