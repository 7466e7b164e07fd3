#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![doc = include_str!("../README.md")]

pub mod channel;
pub mod frag;
pub mod limit;
pub mod packet;
pub mod rtt;
pub mod stats;

mod callback;
mod carrier;
mod clock;
mod config;
mod connection;
mod event;
mod handle;
mod handshake;
mod recv;
mod send;
mod thread;
mod traffic;

pub use {
    self::{
        carrier::{BuildError, Carrier, CarrierBuilder},
        channel::{ChannelIndex, Priority, Reliability, SendOptions},
        config::{CarrierConfig, ConfigError, CongestionConfig},
        connection::{ConnectionId, ConnectionState, DisconnectReason},
        event::{CarrierEvent, CarrierListener},
        handle::{CarrierHandle, ReceiveResult, ReceiveState},
        handshake::{DefaultHandshake, Handshake, HandshakeResult},
        stats::{ConnectionStatistics, FlowInformation, Statistics},
        thread::CarrierThread,
    },
    carrier_io, octs,
};
