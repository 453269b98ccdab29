// src/lua.rs - Lua scripts for atomic store operations
use redis::Script;

/// Every multi-step mutation of the store goes through one of these
/// scripts, so concurrent callers only ever observe whole transitions.
pub struct LuaScripts {
    pub enqueue: Script,
    pub claim: Script,
    pub promote: Script,
    pub renew: Script,
    pub complete: Script,
    pub fail: Script,
    pub expire: Script,
    pub cancel: Script,
    pub purge: Script,
}

impl LuaScripts {
    pub fn new() -> Self {
        Self {
            enqueue: Script::new(include_str!("./lua/enqueue.lua")),
            claim: Script::new(include_str!("./lua/claim.lua")),
            promote: Script::new(include_str!("./lua/promote.lua")),
            renew: Script::new(include_str!("./lua/renew.lua")),
            complete: Script::new(include_str!("./lua/complete.lua")),
            fail: Script::new(include_str!("./lua/fail.lua")),
            expire: Script::new(include_str!("./lua/expire.lua")),
            cancel: Script::new(include_str!("./lua/cancel.lua")),
            purge: Script::new(include_str!("./lua/purge.lua")),
        }
    }
}

impl Default for LuaScripts {
    fn default() -> Self {
        Self::new()
    }
}
