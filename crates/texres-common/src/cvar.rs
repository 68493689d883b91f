// cvar.rs: console variable registry
//
// Tuning knobs for the texture cache live here as named string/float pairs
// so they can be set from config files and the console, the same way every
// other engine setting is.

use std::collections::HashMap;
use std::io;

use bitflags::bitflags;
use tracing::{debug, info};

use crate::wildcards::wildcardfit;

bitflags! {
    /// Behavior flags attached to a cvar.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CvarFlags: u32 {
        /// Written out by `write_variables`.
        const ARCHIVE = 1;
        /// Cannot be changed from the console.
        const NOSET = 8;
        /// Changes are held back while the device is running.
        const LATCH = 16;
    }
}

/// A console variable.
#[derive(Debug, Clone)]
pub struct Cvar {
    pub name: String,
    pub string: String,
    pub latched_string: Option<String>,
    pub flags: CvarFlags,
    pub modified: bool,
    pub value: f32,
}

fn parse_value(s: &str) -> f32 {
    s.trim().parse::<f32>().unwrap_or(0.0)
}

/// The cvar registry.
#[derive(Debug, Default)]
pub struct CvarContext {
    pub cvar_vars: Vec<Cvar>,
    /// O(1) lookup by name -> index in cvar_vars
    cvar_index: HashMap<String, usize>,
    /// While set, LATCH variables queue their new value instead of applying it.
    latch_active: bool,
}

impl CvarContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold back LATCH changes until `get_latched_vars` (device running).
    pub fn set_latch_active(&mut self, active: bool) {
        self.latch_active = active;
    }

    pub fn find_var_index(&self, name: &str) -> Option<usize> {
        self.cvar_index.get(name).copied()
    }

    pub fn find_var(&self, name: &str) -> Option<&Cvar> {
        self.cvar_index.get(name).map(|&idx| &self.cvar_vars[idx])
    }

    /// Float value of a cvar. Returns 0 if not found.
    pub fn variable_value(&self, name: &str) -> f32 {
        self.find_var(name).map_or(0.0, |var| var.value)
    }

    /// String value of a cvar. Returns "" if not found.
    pub fn variable_string(&self, name: &str) -> &str {
        self.find_var(name).map_or("", |var| var.string.as_str())
    }

    /// Get or create a cvar. An existing cvar keeps its value but has
    /// `flags` OR'd in; `default` is only used on creation.
    pub fn get(&mut self, name: &str, default: &str, flags: CvarFlags) -> usize {
        if let Some(&idx) = self.cvar_index.get(name) {
            self.cvar_vars[idx].flags |= flags;
            return idx;
        }

        let idx = self.cvar_vars.len();
        self.cvar_vars.push(Cvar {
            name: name.to_string(),
            string: default.to_string(),
            latched_string: None,
            flags,
            modified: true,
            value: parse_value(default),
        });
        self.cvar_index.insert(name.to_string(), idx);
        idx
    }

    fn set2(&mut self, name: &str, value: &str, force: bool) -> usize {
        let idx = match self.find_var_index(name) {
            Some(idx) => idx,
            None => return self.get(name, value, CvarFlags::empty()),
        };

        let latch_active = self.latch_active;
        let var = &mut self.cvar_vars[idx];

        if !force {
            if var.flags.contains(CvarFlags::NOSET) {
                info!("{} is write protected.", name);
                return idx;
            }

            if var.flags.contains(CvarFlags::LATCH) {
                let pending = var.latched_string.as_deref().unwrap_or(&var.string);
                if value == pending {
                    return idx;
                }
                if latch_active {
                    info!("{} will be changed on the next device reset.", name);
                    var.latched_string = Some(value.to_string());
                    return idx;
                }
            }
        } else {
            var.latched_string = None;
        }

        if value == var.string {
            return idx;
        }

        var.modified = true;
        var.string = value.to_string();
        var.value = parse_value(value);
        idx
    }

    /// Set a cvar value (respects NOSET and LATCH).
    pub fn set(&mut self, name: &str, value: &str) -> usize {
        self.set2(name, value, false)
    }

    /// Force-set a cvar value (ignores NOSET and LATCH).
    pub fn force_set(&mut self, name: &str, value: &str) -> usize {
        self.set2(name, value, true)
    }

    /// Set a cvar from a float value.
    pub fn set_value(&mut self, name: &str, value: f32) -> usize {
        let val_str = if value == (value as i64) as f32 {
            format!("{}", value as i64)
        } else {
            format!("{}", value)
        };
        self.set(name, &val_str)
    }

    /// Apply all latched changes. Returns the names that changed.
    pub fn get_latched_vars(&mut self) -> Vec<String> {
        let mut applied = Vec::new();
        for var in &mut self.cvar_vars {
            if let Some(latched) = var.latched_string.take() {
                if latched != var.string {
                    var.value = parse_value(&latched);
                    var.string = latched;
                    var.modified = true;
                    applied.push(var.name.clone());
                }
            }
        }
        applied
    }

    /// Clear the modified bit on every cvar matching `pattern` and return
    /// the names that had it set.
    pub fn check_modified(&mut self, pattern: &str) -> Vec<String> {
        let mut changed = Vec::new();
        for var in &mut self.cvar_vars {
            if !var.modified || !wildcardfit(pattern, &var.name) {
                continue;
            }
            var.modified = false;
            debug!("var = \"{}\"; modified", var.name);
            changed.push(var.name.clone());
        }
        changed
    }

    /// Console handling for a bare variable name: print with one argument,
    /// set with two. Returns false if `argv[0]` is not a cvar.
    pub fn command(&mut self, argv: &[&str]) -> bool {
        let Some(&name) = argv.first() else {
            return false;
        };
        let Some(idx) = self.find_var_index(name) else {
            return false;
        };

        match argv.get(1) {
            None => {
                let var = &self.cvar_vars[idx];
                info!("\"{}\" is \"{}\"", var.name, var.string);
            }
            Some(value) => {
                let name = self.cvar_vars[idx].name.clone();
                self.set(&name, value);
            }
        }
        true
    }

    /// Execute config text made of `set <name> <value>` lines.
    /// Unknown commands and comments are skipped. Returns the number of
    /// variables set.
    pub fn exec_config(&mut self, text: &str) -> usize {
        let mut count = 0;
        for line in text.lines() {
            let tokens = tokenize(line);
            match tokens.as_slice() {
                [cmd, name, value, ..] if cmd == "set" => {
                    self.set(name, value);
                    count += 1;
                }
                [cmd, ..] if cmd == "set" => info!("usage: set <variable> <value>"),
                _ => {}
            }
        }
        count
    }

    /// Write all archived cvars in `exec_config` syntax.
    pub fn write_variables(&self, writer: &mut dyn io::Write) -> io::Result<()> {
        for var in &self.cvar_vars {
            if var.flags.contains(CvarFlags::ARCHIVE) {
                writeln!(writer, "set {} \"{}\"", var.name, var.string)?;
            }
        }
        Ok(())
    }
}

/// Split a config line into whitespace separated tokens, honoring double
/// quotes and stopping at a `//` comment.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let Some(&c) = chars.peek() else { break };

        if c == '/' {
            let mut ahead = chars.clone();
            ahead.next();
            if ahead.peek() == Some(&'/') {
                break;
            }
        }

        let mut token = String::new();
        if c == '"' {
            chars.next();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                token.push(c);
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        tokens.push(token);
    }

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cvar_get_and_find() {
        let mut ctx = CvarContext::new();
        ctx.get("tex_pool_slots", "42", CvarFlags::empty());
        assert_eq!(ctx.variable_value("tex_pool_slots"), 42.0);
        assert_eq!(ctx.variable_string("tex_pool_slots"), "42");
    }

    #[test]
    fn test_cvar_get_keeps_existing_value() {
        let mut ctx = CvarContext::new();
        ctx.get("tex_thrash_window", "4", CvarFlags::empty());
        ctx.set("tex_thrash_window", "6");
        ctx.get("tex_thrash_window", "4", CvarFlags::ARCHIVE);
        assert_eq!(ctx.variable_value("tex_thrash_window"), 6.0);
        assert!(ctx.find_var("tex_thrash_window").unwrap().flags.contains(CvarFlags::ARCHIVE));
    }

    #[test]
    fn test_cvar_noset() {
        let mut ctx = CvarContext::new();
        ctx.get("tex_version", "1", CvarFlags::NOSET);
        ctx.set("tex_version", "2");
        assert_eq!(ctx.variable_value("tex_version"), 1.0);
        ctx.force_set("tex_version", "2");
        assert_eq!(ctx.variable_value("tex_version"), 2.0);
    }

    #[test]
    fn test_cvar_latch_while_active() {
        let mut ctx = CvarContext::new();
        ctx.get("tex_pool_budget_kb", "4096", CvarFlags::LATCH);
        ctx.set_latch_active(true);
        ctx.set("tex_pool_budget_kb", "8192");
        assert_eq!(ctx.variable_value("tex_pool_budget_kb"), 4096.0);

        let applied = ctx.get_latched_vars();
        assert_eq!(applied, vec!["tex_pool_budget_kb".to_string()]);
        assert_eq!(ctx.variable_value("tex_pool_budget_kb"), 8192.0);
    }

    #[test]
    fn test_cvar_latch_inactive_applies_immediately() {
        let mut ctx = CvarContext::new();
        ctx.get("tex_pool_budget_kb", "4096", CvarFlags::LATCH);
        ctx.set("tex_pool_budget_kb", "1024");
        assert_eq!(ctx.variable_value("tex_pool_budget_kb"), 1024.0);
        assert!(ctx.get_latched_vars().is_empty());
    }

    #[test]
    fn test_cvar_set_value() {
        let mut ctx = CvarContext::new();
        ctx.set_value("tex_fallback_grey", 128.0);
        assert_eq!(ctx.variable_string("tex_fallback_grey"), "128");
        ctx.set_value("tex_scale", 0.5);
        assert_eq!(ctx.variable_string("tex_scale"), "0.5");
    }

    #[test]
    fn test_cvar_check_modified() {
        let mut ctx = CvarContext::new();
        ctx.get("tex_pool_slots", "0", CvarFlags::empty());
        ctx.get("vid_mode", "3", CvarFlags::empty());

        let changed = ctx.check_modified("tex_*");
        assert_eq!(changed, vec!["tex_pool_slots".to_string()]);
        assert!(ctx.check_modified("tex_*").is_empty());

        ctx.set("tex_pool_slots", "8");
        assert_eq!(ctx.check_modified("tex_*"), vec!["tex_pool_slots".to_string()]);
    }

    #[test]
    fn test_cvar_command() {
        let mut ctx = CvarContext::new();
        ctx.get("tex_direct_map", "0", CvarFlags::empty());
        assert!(ctx.command(&["tex_direct_map"]));
        assert!(ctx.command(&["tex_direct_map", "1"]));
        assert_eq!(ctx.variable_value("tex_direct_map"), 1.0);
        assert!(!ctx.command(&["nonexistent", "1"]));
        assert!(!ctx.command(&[]));
    }

    #[test]
    fn test_cvar_not_found() {
        let ctx = CvarContext::new();
        assert_eq!(ctx.variable_value("nonexistent"), 0.0);
        assert_eq!(ctx.variable_string("nonexistent"), "");
    }

    #[test]
    fn test_exec_config() {
        let mut ctx = CvarContext::new();
        let text = "// texture cache tuning\n\
                    set tex_pool_slots 4\n\
                    set tex_thrash_window \"6\" // trailing comment\n\
                    bind x +attack\n\
                    set\n";
        assert_eq!(ctx.exec_config(text), 2);
        assert_eq!(ctx.variable_value("tex_pool_slots"), 4.0);
        assert_eq!(ctx.variable_value("tex_thrash_window"), 6.0);
    }

    #[test]
    fn test_write_variables_round_trips_through_exec() {
        let mut ctx = CvarContext::new();
        ctx.get("tex_pool_max_slots", "64", CvarFlags::ARCHIVE);
        ctx.get("tex_scratch", "1", CvarFlags::empty());

        let mut out = Vec::new();
        ctx.write_variables(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "set tex_pool_max_slots \"64\"\n");

        let mut other = CvarContext::new();
        assert_eq!(other.exec_config(&text), 1);
        assert_eq!(other.variable_value("tex_pool_max_slots"), 64.0);
    }

    #[test]
    fn test_tokenize_quotes() {
        assert_eq!(tokenize("set a \"b c\""), vec!["set", "a", "b c"]);
        assert_eq!(tokenize("   "), Vec::<String>::new());
        assert_eq!(tokenize("// all comment"), Vec::<String>::new());
    }
}
