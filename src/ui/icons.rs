//! Shared UI icons and emojis.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[!]");

// Issue outcomes
pub static MERGED: Emoji<'_, '_> = Emoji("🔀 ", "[M]");
pub static CLOSED: Emoji<'_, '_> = Emoji("📁 ", "[C]");
pub static PAUSED: Emoji<'_, '_> = Emoji("⏸️  ", "[||]");

// Plan indicators
pub static WAVE: Emoji<'_, '_> = Emoji("🌊 ", "[W]");
pub static BLOCKER: Emoji<'_, '_> = Emoji("🚧 ", "[BLOCK]");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[T]");
