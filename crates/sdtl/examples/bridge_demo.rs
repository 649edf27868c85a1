// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Two services on an in-memory bridge exchanging a fragmented message.
//!
//! Run with: `cargo run --example bridge_demo`

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sdtl::{ChannelConfig, ChannelKind, SdtlConfig, SdtlService, TestBridge};

fn main() -> sdtl::Result<()> {
    let (near_end, far_end) = TestBridge::pair();

    let config = SdtlConfig {
        mtu: 64,
        ..Default::default()
    };

    let near = SdtlService::new("demo-near", config.clone(), Arc::new(near_end))?;
    let far = SdtlService::new("demo-far", config, Arc::new(far_end))?;

    for service in [&near, &far] {
        service.create_channel(ChannelConfig {
            id: 1,
            name: "demo".into(),
            kind: ChannelKind::Reliable,
            mtu_override: 0,
        })?;
        service.start()?;
    }

    let rx = far.channel("demo")?;
    let receiver = thread::spawn(move || {
        rx.recv_arm_timeout(2_000_000);
        let mut buf = vec![0u8; 4096];
        rx.recv_data(&mut buf).map(|n| buf[..n].to_vec())
    });

    thread::sleep(Duration::from_millis(20));

    let tx = near.channel("demo")?;
    let message: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
    tx.send_data(&message)?;

    let received = receiver.join().expect("receiver panicked")?;
    assert_eq!(received, message);

    println!(
        "delivered {} bytes in {} fragments ({} retries)",
        received.len(),
        tx.tx_stat().packets,
        tx.tx_stat().retries
    );
    println!(
        "receiver stats: {} fragments, {} acks emitted",
        far.channel("demo")?.rx_stat().packets,
        far.channel("demo")?.rx_stat().acks
    );

    near.stop()?;
    far.stop()?;
    Ok(())
}
