//! Server-side scripts of the shared registry.
//!
//! Every mutating script runs atomically inside Redis and carries the
//! reallocation logic by value (the `RECALC_PRELUDE` is prepended at
//! assembly time), so no two instances can ever observe a half-updated
//! registry.
//!
//! Common contract: `KEYS[1]` is the configured key prefix; all derived
//! key names (`instances`, `allocations`, `modelCapacities`,
//! `jobTypeResources`, `usage:<model>:<kind>:<windowStart>`) are built
//! from it inside the script. `ARGV[1]` is always the caller's epoch-ms
//! timestamp; further arguments are per script.

use lazy_static::lazy_static;
use redis::Script;

/// Shared reallocation logic. Mirrors `recalc::recalculate` exactly:
/// per-dimension even split, slot minimum over the constraining
/// dimensions, in-flight bias toward the least-loaded instance, and the
/// second-pass clamp. Publishes every updated allocation on the
/// `<prefix>allocations` channel.
pub const RECALC_PRELUDE: &str = r#"
local function decode_or(raw, default)
  if raw then return cjson.decode(raw) end
  return default
end

local function recalc(prefix, now)
  local instances = {}
  local instance_ids = {}
  local raw = redis.call('HGETALL', prefix .. 'instances')
  for i = 1, #raw, 2 do
    instances[raw[i]] = cjson.decode(raw[i + 1])
    table.insert(instance_ids, raw[i])
  end
  table.sort(instance_ids)
  local n = #instance_ids

  if n == 0 then
    redis.call('DEL', prefix .. 'allocations')
    return
  end

  local model_ids = {}
  local capacities = {}
  raw = redis.call('HGETALL', prefix .. 'modelCapacities')
  for i = 1, #raw, 2 do
    capacities[raw[i]] = cjson.decode(raw[i + 1])
    table.insert(model_ids, raw[i])
  end
  table.sort(model_ids)

  local est_tokens = 0
  local est_requests = 0
  raw = redis.call('HGETALL', prefix .. 'jobTypeResources')
  for i = 1, #raw, 2 do
    local resource = cjson.decode(raw[i + 1])
    if resource.estimatedUsedTokens and resource.estimatedUsedTokens > est_tokens then
      est_tokens = resource.estimatedUsedTokens
    end
    if resource.estimatedNumberOfRequests and resource.estimatedNumberOfRequests > est_requests then
      est_requests = resource.estimatedNumberOfRequests
    end
  end

  local minute_start = now - (now % 60000)
  local day_start = now - (now % 86400000)

  local allocations = {}
  for _, id in ipairs(instance_ids) do
    allocations[id] = { instanceCount = n, pools = {}, dynamicLimits = {} }
  end

  for _, model_id in ipairs(model_ids) do
    local cfg = capacities[model_id]

    local function used(kind, field, window_start)
      local value = redis.call('HGET',
        prefix .. 'usage:' .. model_id .. ':' .. kind .. ':' .. window_start, field)
      if value then return tonumber(value) end
      return 0
    end

    local dims = {
      { name = 'tokensPerMinute', limit = cfg.tokensPerMinute, est = est_tokens,
        used = used('tpm', 'actualTokens', minute_start) },
      { name = 'tokensPerDay', limit = cfg.tokensPerDay, est = est_tokens,
        used = used('tpd', 'actualTokens', day_start) },
      { name = 'requestsPerMinute', limit = cfg.requestsPerMinute, est = est_requests,
        used = used('rpm', 'actualRequests', minute_start) },
      { name = 'requestsPerDay', limit = cfg.requestsPerDay, est = est_requests,
        used = used('rpd', 'actualRequests', day_start) },
    }

    local global_slots = nil
    local base_slots = nil
    for _, dim in ipairs(dims) do
      if dim.limit then
        dim.remaining = dim.limit - dim.used
        if dim.remaining < 0 then dim.remaining = 0 end
        dim.per_instance = math.floor(dim.remaining / n)
        if dim.est > 0 then
          local g = math.floor(dim.remaining / dim.est)
          local b = math.floor(dim.per_instance / dim.est)
          if global_slots == nil or g < global_slots then global_slots = g end
          if base_slots == nil or b < base_slots then base_slots = b end
        end
      end
    end

    -- A model with no constraining dimension is not pooled; the local
    -- limiter alone gates it.
    if global_slots ~= nil then
      local shares = {}
      local total_in_flight = 0
      for _, id in ipairs(instance_ids) do
        local held = 0
        local by_model = instances[id].inFlightByModel
        if by_model and by_model[model_id] then held = by_model[model_id] end
        total_in_flight = total_in_flight + held
        local slots = base_slots - held
        if slots < 0 then slots = 0 end
        table.insert(shares, { id = id, in_flight = held, slots = slots })
      end

      local allocated_sum = 0
      for _, share in ipairs(shares) do allocated_sum = allocated_sum + share.slots end

      local spare = global_slots - allocated_sum - total_in_flight
      while spare > 0 do
        local least = shares[1]
        for _, share in ipairs(shares) do
          if share.in_flight + share.slots < least.in_flight + least.slots then least = share end
        end
        least.slots = least.slots + 1
        allocated_sum = allocated_sum + 1
        spare = spare - 1
      end

      local budget = global_slots - total_in_flight
      if budget < 0 then budget = 0 end
      while allocated_sum > budget do
        local most = shares[1]
        for _, share in ipairs(shares) do
          if share.slots >= most.slots then most = share end
        end
        if most.slots == 0 then break end
        most.slots = most.slots - 1
        allocated_sum = allocated_sum - 1
      end

      for _, share in ipairs(shares) do
        local pool = { totalSlots = share.slots }
        local limits = {}
        for _, dim in ipairs(dims) do
          if dim.limit then
            pool[dim.name] = dim.per_instance
            limits[dim.name] = dim.per_instance
          else
            pool[dim.name] = 0
          end
        end
        allocations[share.id].pools[model_id] = pool
        allocations[share.id].dynamicLimits[model_id] = limits
      end
    end
  end

  for _, id in ipairs(instance_ids) do
    local payload = cjson.encode(allocations[id])
    redis.call('HSET', prefix .. 'allocations', id, payload)
    redis.call('PUBLISH', prefix .. 'allocations',
      cjson.encode({ instanceId = id, allocation = allocations[id] }))
  end
end
"#;

/// `ARGV: [now, instanceId]`. Upserts the instance (keeping any in-flight
/// counters it already had), reallocates, and returns the caller's
/// allocation JSON.
const REGISTER_BODY: &str = r#"
local prefix = KEYS[1]
local now = tonumber(ARGV[1])
local instance_id = ARGV[2]

local record = decode_or(redis.call('HGET', prefix .. 'instances', instance_id),
  { inFlightByModel = {} })
record.lastHeartbeat = now
if record.inFlightByModel == nil then record.inFlightByModel = {} end
redis.call('HSET', prefix .. 'instances', instance_id, cjson.encode(record))

recalc(prefix, now)

local allocation = redis.call('HGET', prefix .. 'allocations', instance_id)
if allocation then return allocation end
return cjson.encode({ instanceCount = 0, pools = {} })
"#;

/// `ARGV: [now, instanceId]`.
const UNREGISTER_BODY: &str = r#"
local prefix = KEYS[1]
local now = tonumber(ARGV[1])
local instance_id = ARGV[2]

redis.call('HDEL', prefix .. 'instances', instance_id)
redis.call('HDEL', prefix .. 'allocations', instance_id)

recalc(prefix, now)
return 1
"#;

/// `ARGV: [now, instanceId]`. Refreshes the heartbeat and reallocates so
/// allocations stay fresh as usage windows roll.
const HEARTBEAT_BODY: &str = r#"
local prefix = KEYS[1]
local now = tonumber(ARGV[1])
local instance_id = ARGV[2]

local raw = redis.call('HGET', prefix .. 'instances', instance_id)
if raw then
  local record = cjson.decode(raw)
  record.lastHeartbeat = now
  redis.call('HSET', prefix .. 'instances', instance_id, cjson.encode(record))
end

recalc(prefix, now)
return 1
"#;

/// `ARGV: [now, cutoff]`. Removes instances whose heartbeat predates the
/// cutoff.
const CLEANUP_BODY: &str = r#"
local prefix = KEYS[1]
local now = tonumber(ARGV[1])
local cutoff = tonumber(ARGV[2])

local removed = 0
local raw = redis.call('HGETALL', prefix .. 'instances')
for i = 1, #raw, 2 do
  local record = cjson.decode(raw[i + 1])
  if record.lastHeartbeat < cutoff then
    redis.call('HDEL', prefix .. 'instances', raw[i])
    redis.call('HDEL', prefix .. 'allocations', raw[i])
    removed = removed + 1
  end
end

if removed > 0 then
  recalc(prefix, now)
end
return removed
"#;

/// `ARGV: [now, instanceId, modelId]`. The global-pool gate: takes one
/// slot from the instance's allocation if any is left. Returns 1/0.
const ACQUIRE_BODY: &str = r#"
local prefix = KEYS[1]
local now = tonumber(ARGV[1])
local instance_id = ARGV[2]
local model_id = ARGV[3]

local raw = redis.call('HGET', prefix .. 'allocations', instance_id)
if not raw then return 0 end
local allocation = cjson.decode(raw)
local pool = allocation.pools[model_id]
if not pool or pool.totalSlots <= 0 then return 0 end

pool.totalSlots = pool.totalSlots - 1
redis.call('HSET', prefix .. 'allocations', instance_id, cjson.encode(allocation))

local record = decode_or(redis.call('HGET', prefix .. 'instances', instance_id),
  { lastHeartbeat = now, inFlightByModel = {} })
if record.inFlightByModel == nil then record.inFlightByModel = {} end
record.inFlightByModel[model_id] = (record.inFlightByModel[model_id] or 0) + 1
redis.call('HSET', prefix .. 'instances', instance_id, cjson.encode(record))

return 1
"#;

/// `ARGV: [now, instanceId, modelId, actualTokens, actualRequests,
/// minuteWindowStart, dayWindowStart]`. Books actual usage under the
/// reservation's window stamps, releases the in-flight slot, and
/// reallocates.
const RELEASE_BODY: &str = r#"
local prefix = KEYS[1]
local now = tonumber(ARGV[1])
local instance_id = ARGV[2]
local model_id = ARGV[3]
local actual_tokens = tonumber(ARGV[4])
local actual_requests = tonumber(ARGV[5])
local minute_start = ARGV[6]
local day_start = ARGV[7]

if actual_tokens > 0 then
  local tpm_key = prefix .. 'usage:' .. model_id .. ':tpm:' .. minute_start
  redis.call('HINCRBY', tpm_key, 'actualTokens', actual_tokens)
  redis.call('HSET', tpm_key, 'lastUpdate', now)
  redis.call('EXPIRE', tpm_key, 120)

  local tpd_key = prefix .. 'usage:' .. model_id .. ':tpd:' .. day_start
  redis.call('HINCRBY', tpd_key, 'actualTokens', actual_tokens)
  redis.call('HSET', tpd_key, 'lastUpdate', now)
  redis.call('EXPIRE', tpd_key, 90000)
end

if actual_requests > 0 then
  local rpm_key = prefix .. 'usage:' .. model_id .. ':rpm:' .. minute_start
  redis.call('HINCRBY', rpm_key, 'actualRequests', actual_requests)
  redis.call('HSET', rpm_key, 'lastUpdate', now)
  redis.call('EXPIRE', rpm_key, 120)

  local rpd_key = prefix .. 'usage:' .. model_id .. ':rpd:' .. day_start
  redis.call('HINCRBY', rpd_key, 'actualRequests', actual_requests)
  redis.call('HSET', rpd_key, 'lastUpdate', now)
  redis.call('EXPIRE', rpd_key, 90000)
end

local raw = redis.call('HGET', prefix .. 'instances', instance_id)
if raw then
  local record = cjson.decode(raw)
  if record.inFlightByModel and record.inFlightByModel[model_id] then
    record.inFlightByModel[model_id] = record.inFlightByModel[model_id] - 1
    if record.inFlightByModel[model_id] <= 0 then
      record.inFlightByModel[model_id] = nil
    end
    redis.call('HSET', prefix .. 'instances', instance_id, cjson.encode(record))
  end
end

recalc(prefix, now)
return 1
"#;

/// `ARGV: [now, modelCapacitiesJson, jobTypeResourcesJson]`. Pushes the
/// local configuration into the shared registry and reallocates.
const INIT_CONFIG_BODY: &str = r#"
local prefix = KEYS[1]
local now = tonumber(ARGV[1])
local models = cjson.decode(ARGV[2])
local job_types = cjson.decode(ARGV[3])

for model_id, config in pairs(models) do
  redis.call('HSET', prefix .. 'modelCapacities', model_id, cjson.encode(config))
end
for job_type, resources in pairs(job_types) do
  redis.call('HSET', prefix .. 'jobTypeResources', job_type, cjson.encode(resources))
end

recalc(prefix, now)
return 1
"#;

/// `ARGV: [now]`. Read-only cluster snapshot; no recalculation.
const GET_STATS_BODY: &str = r#"
local prefix = KEYS[1]

local function hash_to_table(key)
  local out = {}
  local raw = redis.call('HGETALL', key)
  for i = 1, #raw, 2 do
    out[raw[i]] = cjson.decode(raw[i + 1])
  end
  return out
end

return cjson.encode({
  instances = hash_to_table(prefix .. 'instances'),
  allocations = hash_to_table(prefix .. 'allocations'),
  modelCapacities = hash_to_table(prefix .. 'modelCapacities'),
  jobTypeResources = hash_to_table(prefix .. 'jobTypeResources'),
})
"#;

fn with_prelude(body: &str) -> String {
    format!("{}\n{}", RECALC_PRELUDE, body)
}

lazy_static! {
    pub static ref REGISTER_SCRIPT: Script = Script::new(&with_prelude(REGISTER_BODY));
    pub static ref UNREGISTER_SCRIPT: Script = Script::new(&with_prelude(UNREGISTER_BODY));
    pub static ref HEARTBEAT_SCRIPT: Script = Script::new(&with_prelude(HEARTBEAT_BODY));
    pub static ref CLEANUP_SCRIPT: Script = Script::new(&with_prelude(CLEANUP_BODY));
    pub static ref ACQUIRE_SCRIPT: Script = Script::new(&with_prelude(ACQUIRE_BODY));
    pub static ref RELEASE_SCRIPT: Script = Script::new(&with_prelude(RELEASE_BODY));
    pub static ref INIT_CONFIG_SCRIPT: Script = Script::new(&with_prelude(INIT_CONFIG_BODY));
    pub static ref GET_STATS_SCRIPT: Script = Script::new(GET_STATS_BODY);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutating_scripts_carry_the_recalc_prelude() {
        for body in [
            REGISTER_BODY,
            UNREGISTER_BODY,
            HEARTBEAT_BODY,
            CLEANUP_BODY,
            ACQUIRE_BODY,
            RELEASE_BODY,
            INIT_CONFIG_BODY,
        ] {
            let assembled = with_prelude(body);
            assert!(assembled.contains("local function recalc"));
        }
    }

    #[test]
    fn usage_keys_match_the_documented_layout() {
        assert!(RELEASE_BODY.contains("'usage:' .. model_id .. ':tpm:'"));
        assert!(RELEASE_BODY.contains("'usage:' .. model_id .. ':tpd:'"));
        assert!(RELEASE_BODY.contains("'usage:' .. model_id .. ':rpm:'"));
        assert!(RELEASE_BODY.contains("'usage:' .. model_id .. ':rpd:'"));
    }
}
