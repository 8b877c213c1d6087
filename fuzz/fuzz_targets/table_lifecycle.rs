#![no_main]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use correlate_core::config::TableConfig;
use correlate_core::{
    CorrelationTable, Delay, ManualTimer, MessageOptions, MessageTable, RegisterOptions, TimedOut,
};
use libfuzzer_sys::fuzz_target;
use serde_json::{Value, json};

#[derive(Default, Clone, Copy)]
struct Settled {
    successes: u32,
    failures: u32,
}

type Ledger = Arc<Mutex<Vec<Settled>>>;

fn open_slot(ledger: &Ledger) -> usize {
    let mut slots = ledger.lock().unwrap();
    slots.push(Settled::default());
    slots.len() - 1
}

fn on_ok<T: 'static>(ledger: &Ledger, slot: usize) -> impl FnOnce(T) + Send + 'static {
    let ledger = Arc::clone(ledger);
    move |_| ledger.lock().unwrap()[slot].successes += 1
}

fn on_err(ledger: &Ledger, slot: usize) -> impl FnOnce(TimedOut) + Send + 'static {
    let ledger = Arc::clone(ledger);
    move |_| ledger.lock().unwrap()[slot].failures += 1
}

fn message_id(byte: u8) -> Value {
    match byte % 4 {
        0 => Value::Null,
        1 => json!(u64::from(byte >> 2)),
        2 => json!(format!("r{}", byte >> 2)),
        _ => json!({"n": byte >> 4, "s": byte & 3}),
    }
}

fuzz_target!(|data: &[u8]| {
    if data.len() > 16_384 {
        return;
    }

    let timer = ManualTimer::new();
    let config = TableConfig {
        max_pending: usize::from(data.first().copied().unwrap_or(0) % 8),
        fail_on_missing_id: data.get(1).is_some_and(|b| b & 1 == 1),
        ..TableConfig::default()
    };
    let keyed: CorrelationTable<u8, u8> =
        CorrelationTable::with_config(Arc::new(timer.clone()), config.clone());
    let messages: MessageTable<Value> = MessageTable::with_config(Arc::new(timer.clone()), config);
    let ledger: Ledger = Arc::new(Mutex::new(Vec::new()));

    for chunk in data.chunks_exact(3) {
        let (op, a, b) = (chunk[0], chunk[1], chunk[2]);
        let key = a % 16;
        match op % 9 {
            0 | 1 => {
                let slot = open_slot(&ledger);
                let mut options = RegisterOptions::new();
                if b & 1 == 1 {
                    options = options.delay(Delay::from_millis(u64::from(b >> 1)));
                }
                if b & 2 == 2 {
                    options = options.transform(|v: u8| v.wrapping_add(1));
                }
                let _ = keyed.register(key, on_ok::<u8>(&ledger, slot), on_err(&ledger, slot), options);
            }
            2 | 3 => {
                keyed.resolve(&key, b);
            }
            4 => {
                keyed.cancel(&key);
            }
            5 => {
                timer.advance(Duration::from_millis(u64::from(b)));
            }
            6 => {
                let slot = open_slot(&ledger);
                let message = json!({"request_id": message_id(a), "body": b});
                let _ = messages.register(
                    &message,
                    on_ok::<Value>(&ledger, slot),
                    on_err(&ledger, slot),
                    MessageOptions::new().delay(Delay::from_millis(u64::from(b))),
                );
            }
            7 => {
                messages.resolve(json!({"request_id": message_id(a)}));
            }
            _ => {
                if b == 0xFF {
                    keyed.close();
                } else {
                    messages.cancel(&json!({"request_id": message_id(a)}));
                }
            }
        }

        if keyed.config().max_pending > 0 {
            assert!(keyed.len() <= keyed.config().max_pending);
        }
    }

    timer.advance(Duration::from_secs(3600));
    assert_eq!(timer.pending(), 0);

    for settled in ledger.lock().unwrap().iter() {
        assert!(
            settled.successes + settled.failures <= 1,
            "registration settled more than once"
        );
    }

    let stats = keyed.stats();
    assert_eq!(
        stats.resolved + stats.timed_out + stats.cancelled + stats.pending as u64,
        stats.registered
    );
});
