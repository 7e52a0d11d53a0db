//! `clustercat`: a thin command-line harness over `vrcluster_mux`, used to
//! exercise the wire protocol end-to-end during development.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
#![forbid(unsafe_code)]

use clap::{Parser, Subcommand};
use tracing::{error, info};
use vrcluster_mux::{Config, GatherOp, Multiplexer, ThreadId};

/// Run one node of a demo cluster and put a handful of packets, a barrier,
/// and a gather through the pipe, then print what came back.
#[derive(Debug, Parser)]
#[command(name = "clustercat", version, about)]
struct Args {
    /// Total number of slaves in the cluster (not counting the master).
    #[arg(long, default_value_t = 1)]
    num_slaves: usize,

    /// This node's role/index: `master`, or a slave's 1-based index.
    #[command(subcommand)]
    role: Role,

    /// Host the master's unicast socket is bound on / reachable at.
    #[arg(long, default_value = "127.0.0.1")]
    master_host: String,

    /// Port the master's unicast socket is bound on.
    #[arg(long, default_value_t = 9001)]
    master_port: u16,

    /// Multicast (or broadcast-fallback) group address slaves listen on.
    #[arg(long, default_value = "239.255.0.1")]
    slave_group: String,

    /// Port of the slave group address.
    #[arg(long, default_value_t = 9002)]
    slave_port: u16,
}

#[derive(Debug, Subcommand)]
enum Role {
    /// Run as the master (node index 0).
    Master,
    /// Run as a slave.
    Slave {
        /// This slave's 1-based node index.
        #[arg(long)]
        index: u32,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let node_index = match args.role {
        Role::Master => 0,
        Role::Slave { index } => index,
    };

    let mux = match Multiplexer::new(
        args.num_slaves,
        node_index,
        &args.master_host,
        args.master_port,
        &args.slave_group,
        args.slave_port,
        Config::default(),
    )
    .await
    {
        Ok(mux) => mux,
        Err(e) => {
            error!(error = %e, "failed to start multiplexer");
            std::process::exit(1);
        }
    };

    info!(node_index, "waiting for cluster to connect");
    mux.wait_for_connection().await;
    info!("connected");

    let thread_id = ThreadId::new(vec![0xc1a5, node_index]);
    let pipe_id = match mux.open_pipe(thread_id).await {
        Ok(id) => id,
        Err(e) => {
            error!(error = %e, "open_pipe failed");
            std::process::exit(1);
        }
    };
    info!(pipe_id, "pipe open");

    if node_index == 0 {
        for i in 0..5u32 {
            let payload = format!("frame {i}");
            if let Err(e) = mux.send_packet(pipe_id, payload.as_bytes()).await {
                error!(error = %e, "send_packet failed");
                break;
            }
        }
    } else {
        for _ in 0..5u32 {
            match mux.receive_packet(pipe_id).await {
                Ok(packet) => {
                    let text = String::from_utf8_lossy(packet.payload()).into_owned();
                    info!(%text, "received");
                    mux.release_packet(packet);
                }
                Err(e) => {
                    error!(error = %e, "receive_packet failed");
                    break;
                }
            }
        }
    }

    if let Err(e) = mux.barrier(pipe_id).await {
        error!(error = %e, "barrier failed");
    } else {
        info!("barrier reached");
    }

    match mux.gather(pipe_id, u32::from(node_index), GatherOp::Max).await {
        Ok(value) => info!(value, "gather completed"),
        Err(e) => error!(error = %e, "gather failed"),
    }

    if let Err(e) = mux.close_pipe(pipe_id).await {
        error!(error = %e, "close_pipe failed");
    }
    mux.shutdown().await;
}
