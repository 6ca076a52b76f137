mod autosave;

pub use autosave::{
    AutoSaveEvent, AutoSaveRecovery, AutoSaveStatus, DraftSnapshot, RecoveryNotice, DRAFT_KEY,
};
