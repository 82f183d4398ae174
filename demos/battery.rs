#![allow(unused_crate_dependencies)]
#![allow(clippy::print_stdout)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::info;

use gattsc::att::Handle;
use gattsc::gap::{Characteristic, Service};
use gattsc::gatt::client::cache::{CacheTag, MemStore};
use gattsc::gatt::client::sim::{Db, Sim};
use gattsc::gatt::client::ServiceClients;
use gattsc::gatt::CharProps;
use gattsc::hci::{ConnHandle, Status};
use gattsc::profile::bas::{BatteryClient, BatteryEvent};

#[derive(Clone, Copy, Debug, clap::Parser)]
struct Args {
    /// Initial battery level of the simulated server.
    #[arg(short, long, default_value_t = 80)]
    level: u8,

    /// Number of level notifications to send.
    #[arg(short, long, default_value_t = 3)]
    notify: u8,

    /// Reconnect using the cached handle layout.
    #[arg(short, long)]
    cache: bool,

    /// Database hash reported by the simulated server.
    #[arg(long, value_parser=hex128, default_value = "1")]
    db_hash: u128,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let link = ConnHandle::new(0x40).expect("invalid connection handle");

    let mut db = Db::new();
    db.primary(Service::GenericAccess, |s| {
        s.characteristic(Characteristic::DeviceName, CharProps::READ, b"Battery Demo");
    });
    db.primary(Service::Battery, |s| {
        let props = CharProps::READ | CharProps::NOTIFY;
        s.characteristic(Characteristic::BatteryLevel, props, &[args.level])
            .cccd();
    });
    let store = Arc::new(MemStore::new());
    let mut sc = ServiceClients::new(Sim::new()).with_cache(Arc::clone(&store));
    sc.transport_mut().connect(link, db);

    let events = Rc::new(RefCell::new(Vec::new()));
    let tx = Rc::clone(&events);
    let bas = BatteryClient::register(&mut sc, move |e| {
        println!("{e:?}");
        tx.borrow_mut().push(e);
    });

    let tag = CacheTag::new(0, 0, args.db_hash);
    let cid = bas.connect_cached(&mut sc, link, 0, tag)?;
    info!("Discovery took {} events", sc.run());
    if !matches!(
        events.borrow().last(),
        Some(BatteryEvent::Connected {
            status: Status::Success,
            ..
        })
    ) {
        bail!("failed to connect to the battery service");
    }

    bas.read_level(&mut sc, cid)?;
    sc.run();
    let value = sc.connection(bas.id(), cid).and_then(|c| c.value_handle(0));
    let value: Handle = value.expect("battery level handle not discovered");
    for i in 1..=args.notify {
        let level = args.level.saturating_sub(i);
        sc.transport_mut().notify(link, value, &[level]);
        sc.run();
    }

    if args.cache {
        bas.disconnect(&mut sc, cid)?;
        let n = sc.transport().issued().len();
        let cid = bas.connect_cached(&mut sc, link, 0, tag)?;
        sc.run();
        info!(
            "Reconnected with {} new procedures ({} cache entries)",
            sc.transport().issued().len() - n,
            store.len()
        );
        bas.read_level(&mut sc, cid)?;
        sc.run();
    }
    sc.transport_mut().disconnect(link);
    sc.run();
    println!("Issued procedures: {:?}", sc.transport().issued());
    Ok(())
}

fn hex128(mut s: &str) -> Result<u128, String> {
    if s.starts_with("0x") || s.starts_with("0X") {
        s = &s[2..];
    }
    u128::from_str_radix(s, 16).map_err(|e| format!("{e}"))
}
