//! MBO feed ingest over TCP.
//!
//! The upstream sends one header line followed by line-delimited CSV
//! records (each prefixed with the sender's wall-clock timestamp). Records
//! are normalized into sequenced [`BookEvent`]s per symbol; malformed lines
//! are logged and skipped.

use crate::config::FeedConfig;
use crate::error::{Error, Result};
use crate::types::{BookEvent, BookOrderId, Px, Qty, Side, Symbol};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// Control messages from the engine back into the feed task.
pub enum FeedCommand {
    /// A lane detected a gap or corruption and needs a fresh snapshot.
    Resync(Symbol),
}

/// Handle lanes use to ask the feed for recovery.
#[derive(Clone)]
pub struct FeedHandle {
    tx: flume::Sender<FeedCommand>,
}

impl FeedHandle {
    #[cfg(test)]
    pub(crate) fn with_receiver(capacity: usize) -> (Self, flume::Receiver<FeedCommand>) {
        let (tx, rx) = flume::bounded(capacity);
        (Self { tx }, rx)
    }

    pub fn request_snapshot(&self, symbol: &Symbol) {
        if self
            .tx
            .try_send(FeedCommand::Resync(symbol.clone()))
            .is_err()
        {
            tracing::warn!(%symbol, "feed command channel full, snapshot request dropped");
        }
    }
}

/// Column offsets for the CSV layout, built from the header line. The
/// first column (sender timestamp) is dropped before indexing, matching
/// the record lines.
struct HeaderMap(HashMap<String, usize>);

impl HeaderMap {
    fn parse(line: &str) -> Self {
        let map = line
            .trim_end()
            .split(',')
            .skip(1)
            .enumerate()
            .map(|(i, name)| (name.trim().to_string(), i))
            .collect();
        Self(map)
    }

    fn get<'a>(&self, fields: &'a [&'a str], name: &str) -> Option<&'a str> {
        let v = fields.get(*self.0.get(name)?)?.trim();
        (!v.is_empty()).then_some(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MboAction {
    Add,
    Modify,
    Cancel,
    Trade,
    Clear,
}

/// One parsed MBO record, prices still in the venue's decimal units.
#[derive(Debug, Clone, PartialEq)]
struct MboRecord {
    action: MboAction,
    side: Option<Side>,
    px: Option<Decimal>,
    size: u64,
    order_id: u64,
    symbol: Symbol,
}

fn parse_record(header: &HeaderMap, line: &str) -> Result<MboRecord> {
    let fields: Vec<&str> = line.trim_end().split(',').skip(1).collect();
    let bad = |what: &str| Error::Feed(format!("{what} in record: {line}"));

    let action = match header.get(&fields, "action").ok_or_else(|| bad("missing action"))? {
        "A" => MboAction::Add,
        "M" => MboAction::Modify,
        "C" => MboAction::Cancel,
        // T and F are both prints against a resting order.
        "T" | "F" => MboAction::Trade,
        "R" | "N" => MboAction::Clear,
        other => return Err(Error::Feed(format!("unknown action {other:?} in record: {line}"))),
    };
    let side = match header.get(&fields, "side") {
        Some("B") => Some(Side::Buy),
        Some("A") => Some(Side::Sell),
        _ => None,
    };
    let px = header
        .get(&fields, "price")
        .map(Decimal::from_str)
        .transpose()
        .map_err(|_| bad("bad price"))?;
    let size = header
        .get(&fields, "size")
        .map(|v| v.parse::<f64>().map(|s| s as u64))
        .transpose()
        .map_err(|_| bad("bad size"))?
        .unwrap_or(0);
    let order_id = header
        .get(&fields, "order_id")
        .map(str::parse)
        .transpose()
        .map_err(|_| bad("bad order_id"))?
        .unwrap_or(0);
    let symbol = Symbol::new(header.get(&fields, "symbol").unwrap_or("UNKNOWN"));

    Ok(MboRecord {
        action,
        side,
        px,
        size,
        order_id,
        symbol,
    })
}

/// Turns parsed records into sequenced book events.
///
/// Assigns a contiguous per-symbol sequence and tracks resting-order side
/// and price so a price-changing modify can be split into delete + add
/// (the book's modify is quantity-only and would otherwise keep priority
/// at the wrong level).
struct Normalizer {
    tick_size: Decimal,
    seq: HashMap<Symbol, u64>,
    resting: HashMap<Symbol, HashMap<BookOrderId, (Side, Px)>>,
}

impl Normalizer {
    fn new(tick_size: Decimal) -> Self {
        Self {
            tick_size,
            seq: HashMap::new(),
            resting: HashMap::new(),
        }
    }

    fn next_seq(&mut self, symbol: &Symbol) -> u64 {
        let s = self.seq.entry(symbol.clone()).or_insert(0);
        *s += 1;
        *s
    }

    fn to_ticks(&self, px: Decimal) -> Result<Px> {
        (px / self.tick_size)
            .round()
            .to_i64()
            .map(Px)
            .ok_or_else(|| Error::Feed(format!("price {px} out of tick range")))
    }

    fn normalize(&mut self, rec: MboRecord) -> Result<Vec<(Symbol, BookEvent)>> {
        let symbol = rec.symbol.clone();
        let order_ref = BookOrderId(rec.order_id);
        let mut out = Vec::with_capacity(1);
        match rec.action {
            MboAction::Add => {
                let side = rec
                    .side
                    .ok_or_else(|| Error::Feed(format!("add without side for {symbol}")))?;
                let px = self.to_ticks(
                    rec.px
                        .ok_or_else(|| Error::Feed(format!("add without price for {symbol}")))?,
                )?;
                self.resting
                    .entry(symbol.clone())
                    .or_default()
                    .insert(order_ref, (side, px));
                let seq = self.next_seq(&symbol);
                out.push((
                    symbol,
                    BookEvent::Add {
                        order_ref,
                        side,
                        px,
                        qty: Qty(rec.size),
                        seq,
                    },
                ));
            }
            MboAction::Modify => {
                let Some(&(side, old_px)) = self
                    .resting
                    .get(&symbol)
                    .and_then(|m| m.get(&order_ref))
                else {
                    // Modify for an order we never saw (pre-session resting
                    // order); nothing sensible to emit.
                    tracing::debug!(%symbol, order = order_ref.0, "modify for unknown order, skipped");
                    return Ok(out);
                };
                let new_px = match rec.px {
                    Some(p) => self.to_ticks(p)?,
                    None => old_px,
                };
                if new_px != old_px {
                    if let Some(m) = self.resting.get_mut(&symbol) {
                        m.insert(order_ref, (side, new_px));
                    }
                    let del_seq = self.next_seq(&symbol);
                    out.push((symbol.clone(), BookEvent::Delete { order_ref, seq: del_seq }));
                    let add_seq = self.next_seq(&symbol);
                    out.push((
                        symbol,
                        BookEvent::Add {
                            order_ref,
                            side,
                            px: new_px,
                            qty: Qty(rec.size),
                            seq: add_seq,
                        },
                    ));
                } else {
                    let seq = self.next_seq(&symbol);
                    out.push((
                        symbol,
                        BookEvent::Modify {
                            order_ref,
                            new_qty: Qty(rec.size),
                            seq,
                        },
                    ));
                }
            }
            MboAction::Cancel => {
                if let Some(m) = self.resting.get_mut(&symbol) {
                    m.remove(&order_ref);
                }
                let seq = self.next_seq(&symbol);
                out.push((symbol, BookEvent::Delete { order_ref, seq }));
            }
            MboAction::Trade => {
                let seq = self.next_seq(&symbol);
                out.push((
                    symbol,
                    BookEvent::Trade {
                        order_ref,
                        exec_qty: Qty(rec.size),
                        seq,
                    },
                ));
            }
            MboAction::Clear => {
                out.push(self.clear(&symbol));
            }
        }
        Ok(out)
    }

    /// Empty full-depth snapshot at the next sequence. Used both for the
    /// venue's clear action and to answer lane resync requests: this feed
    /// has no depth-request upstream, so recovery restarts from an empty
    /// book the way the venue's clear does.
    fn clear(&mut self, symbol: &Symbol) -> (Symbol, BookEvent) {
        self.resting.remove(symbol);
        let seq = self.next_seq(symbol);
        (
            symbol.clone(),
            BookEvent::Snapshot {
                levels: Vec::new(),
                seq,
            },
        )
    }
}

/// Spawn the feed task. Connects to `cfg.addr`, retries on connection
/// loss, and forwards normalized events for the configured symbols.
pub fn spawn_feed(
    cfg: FeedConfig,
    symbols: Vec<Symbol>,
    tx: flume::Sender<(Symbol, BookEvent)>,
) -> (FeedHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = flume::bounded(64);
    let handle = FeedHandle { tx: cmd_tx };
    let task = tokio::spawn(async move {
        let mut norm = Normalizer::new(cfg.tick_size);
        loop {
            match run_connection(&cfg, &symbols, &tx, &cmd_rx, &mut norm).await {
                Ok(()) => {
                    tracing::info!("feed connection closed by sender");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "feed connection error, retrying in 2s");
                }
            }
            if tx.is_disconnected() {
                return;
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    });
    (handle, task)
}

async fn run_connection(
    cfg: &FeedConfig,
    symbols: &[Symbol],
    tx: &flume::Sender<(Symbol, BookEvent)>,
    cmd_rx: &flume::Receiver<FeedCommand>,
    norm: &mut Normalizer,
) -> Result<()> {
    let stream = TcpStream::connect(&cfg.addr)
        .await
        .map_err(|e| Error::Feed(format!("connect {}: {e}", cfg.addr)))?;
    tracing::info!(addr = %cfg.addr, "feed connected");
    let mut lines = BufReader::new(stream).lines();

    let first = lines
        .next_line()
        .await
        .map_err(|e| Error::Feed(format!("read header: {e}")))?
        .ok_or_else(|| Error::Feed("empty stream, no header".into()))?;
    let header = HeaderMap::parse(&first);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.map_err(|e| Error::Feed(format!("read: {e}")))? else {
                    return Ok(());
                };
                let rec = match parse_record(&header, &line) {
                    Ok(rec) => rec,
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping malformed record");
                        continue;
                    }
                };
                if !symbols.contains(&rec.symbol) {
                    continue;
                }
                let events = match norm.normalize(rec) {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping unnormalizable record");
                        continue;
                    }
                };
                for ev in events {
                    if tx.send_async(ev).await.is_err() {
                        return Err(Error::ChannelClosed("feed events"));
                    }
                }
            }
            cmd = cmd_rx.recv_async() => {
                match cmd {
                    Ok(FeedCommand::Resync(symbol)) => {
                        tracing::info!(%symbol, "resync requested, issuing clear snapshot");
                        let ev = norm.clear(&symbol);
                        if tx.send_async(ev).await.is_err() {
                            return Err(Error::ChannelClosed("feed events"));
                        }
                    }
                    Err(_) => return Err(Error::ChannelClosed("feed commands")),
                }
            }
        }
    }
}
