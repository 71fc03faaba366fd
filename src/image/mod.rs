pub mod context_iso;
