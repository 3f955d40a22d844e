//! Per-run debug dumps of research and forecast outputs, and their replay.

pub mod document;
pub mod replay;
pub mod writer;

pub use document::{DumpDocument, DumpEvent, DumpForecast, DumpMarket, DumpResearch};
pub use replay::{load_run_dumps, replay_run, EventDump, ReplayOptions, ReplaySummary};
pub use writer::{build_dump_document, dump_path, write_group_dump};
