mod common;
use common::*;

mod data_transfer;
mod handshake;
mod random;
