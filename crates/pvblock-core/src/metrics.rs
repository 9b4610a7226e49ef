use metrics::{counter, gauge};

use crate::validate::Operation;

fn op_name(op: Operation) -> &'static str {
    match op {
        Operation::Read => "read",
        Operation::Write => "write",
        Operation::Flush => "flush",
        Operation::Discard => "discard",
    }
}

pub fn observe_request_done(op: Operation, bytes: usize) {
    counter!("pvblock_requests_completed", "op" => op_name(op)).increment(1);
    counter!("pvblock_bytes_transferred", "op" => op_name(op)).increment(bytes as u64);
}

pub fn observe_request_failed(op: Operation) {
    counter!("pvblock_requests_failed", "op" => op_name(op)).increment(1);
}

pub fn observe_request_invalid() {
    counter!("pvblock_requests_invalid").increment(1);
}

pub fn observe_notify() {
    counter!("pvblock_notifications_sent").increment(1);
}

pub fn record_inflight_requests(count: usize) {
    gauge!("pvblock_inflight_requests").set(count as f64);
}
