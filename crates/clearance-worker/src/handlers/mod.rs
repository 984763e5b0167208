pub mod virus_scan;

pub use virus_scan::VirusScanHandler;
