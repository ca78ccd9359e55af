//! Local HTTP API used by UI clients. Every `/api/*` call carries the token
//! from the user config; anything else gets an empty 404.

use crate::{
    apply::{apply_config, ApplyReport},
    battery,
    config_watch,
    cpu,
    cpu_lock::{self, LockPolicy, LockRequest},
    device::Device,
    gamemode::{clear_ram, GameModeConfig},
    gpu::{self, GpuRenderer},
    mem::read_vmrss_kb,
    notify::post_notification,
    profile_io::{export_to_dir, import_profile},
    profiles::AppProfile,
    ram::{self, RamConfig},
    soc::SocInfo,
    state::{read_state, write_state, Shared},
    thermal::{self, ThermalPreset, ZoneSet},
    tuning::TuningConfig,
    tweaks::{self, AdditionalConfig, PerfMode},
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use std::{
    io::Read,
    path::PathBuf,
    thread,
};
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Failed(String),
    Conflict(Value),
    NotFound,
}

impl From<crate::error::Error> for ApiError {
    fn from(e: crate::error::Error) -> Self {
        ApiError::Failed(e.to_string())
    }
}

type ApiResult = Result<Value, ApiError>;

fn parse<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Adds `"ok": true` to an object payload.
fn ok(mut v: Value) -> ApiResult {
    if let Value::Object(m) = &mut v {
        m.insert("ok".to_string(), Value::Bool(true));
        Ok(v)
    } else {
        Ok(json!({ "ok": true, "data": v }))
    }
}

#[derive(Deserialize)]
struct CpuFreqReq {
    cluster: usize,
    min: u64,
    max: u64,
}

#[derive(Deserialize)]
struct GovernorReq {
    #[serde(default)]
    cluster: Option<usize>,
    governor: String,
}

#[derive(Deserialize)]
struct CoreReq {
    core: usize,
    online: bool,
}

#[derive(Deserialize)]
struct GpuFreqReq {
    min: u64,
    max: u64,
}

#[derive(Deserialize)]
struct PowerLevelReq {
    level: u32,
}

#[derive(Deserialize)]
struct RendererReq {
    renderer: GpuRenderer,
}

#[derive(Deserialize)]
struct ThermalReq {
    preset: ThermalPreset,
    #[serde(default)]
    set_on_boot: Option<bool>,
}

#[derive(Deserialize)]
struct ChargingReq {
    bypass: Option<bool>,
    limit: Option<u64>,
}

#[derive(Deserialize)]
struct SettingsReq {
    set_on_boot: Option<bool>,
    notifications: Option<bool>,
    poll_interval_secs: Option<u64>,
    perf_mode: Option<PerfMode>,
}

/// Request handling, separate from the socket so it can be driven directly.
pub struct Api {
    shared: Shared,
    dev: Device,
    cfg_path: PathBuf,
}

impl Api {
    pub fn new(shared: Shared, dev: Device, cfg_path: PathBuf) -> Self {
        Self { shared, dev, cfg_path }
    }

    fn authorized(&self, token: Option<&str>) -> bool {
        let want = read_state(&self.shared).config.api_token.clone();
        !want.is_empty() && token.is_some_and(|t| t == want)
    }

    /// Returns the status code and JSON body. `Value::Null` means an empty body.
    pub fn handle(&self, method: &Method, url: &str, token: Option<&str>, body: &[u8]) -> (u16, Value) {
        let (path, query) = url.split_once('?').unwrap_or((url, ""));
        if !path.starts_with("/api/") || !self.authorized(token) {
            return (404, Value::Null);
        }

        let res = match (method, path) {
            (Method::Get, "/api/state") => self.state(),
            (Method::Get, "/api/config") => {
                let cfg = read_state(&self.shared).config.clone();
                serde_json::to_value(cfg).map_err(|e| ApiError::Failed(e.to_string()))
            }
            (Method::Get, "/api/device") => self.device_info(),
            (Method::Post, "/api/settings") => self.settings(body),

            (Method::Post, "/api/apply") => parse::<TuningConfig>(body).and_then(|cfg| self.apply(cfg)),
            (Method::Post, "/api/cpu/frequency") => self.cpu_frequency(body),
            (Method::Post, "/api/cpu/governor") => self.cpu_governor(body),
            (Method::Post, "/api/cpu/core") => self.cpu_core(body),
            (Method::Get, "/api/cpu/lock") => self.cpu_lock_status(),
            (Method::Post, "/api/cpu/lock") => self.cpu_lock(body),
            (Method::Post, "/api/cpu/unlock") => self.cpu_unlock(),
            (Method::Post, "/api/gpu/frequency") => self.gpu_frequency(body),
            (Method::Post, "/api/gpu/power-level") => self.gpu_power_level(body),
            (Method::Post, "/api/gpu/renderer") => self.gpu_renderer(body),
            (Method::Post, "/api/thermal") => self.thermal(body),
            (Method::Post, "/api/ram") => self.ram(body),
            (Method::Post, "/api/tweaks") => self.tweaks(body),

            (Method::Get, "/api/export") => self.export(),
            (Method::Post, "/api/import") => {
                let force = query.split('&').any(|kv| kv == "force=1" || kv == "force=true");
                self.import(body, force)
            }

            (Method::Post, "/api/profiles") => self.profiles(body),
            (Method::Post, "/api/games") => self.games(body),
            (Method::Post, "/api/charging") => self.charging(body),
            (Method::Post, "/api/clear-ram") => self.clear_ram(),
            (Method::Post, "/api/reboot") => self.reboot(),
            _ => Err(ApiError::NotFound),
        };

        match res {
            Ok(v) => (200, v),
            Err(ApiError::BadRequest(m)) => (400, json!({ "ok": false, "error": m })),
            Err(ApiError::Failed(m)) => {
                tracing::warn!("WEB: {} failed: {}", path, m);
                (500, json!({ "ok": false, "error": m }))
            }
            Err(ApiError::Conflict(v)) => (409, v),
            Err(ApiError::NotFound) => (404, json!({ "ok": false, "error": "not found" })),
        }
    }

    fn update_config(&self, f: impl FnOnce(&mut crate::user_config::UserConfig)) -> Result<(), ApiError> {
        config_watch::update(&self.shared, &self.cfg_path, f).map_err(ApiError::BadRequest)
    }

    /// Folds a single-control change into the stored tuning, starting from a
    /// capture of the device when nothing is stored yet.
    fn remember(&self, f: impl FnOnce(&mut TuningConfig)) {
        let captured = read_state(&self.shared)
            .config
            .tuning
            .is_none()
            .then(|| TuningConfig::capture(&self.dev));
        let res = self.update_config(|c| {
            if let Some(t) = captured {
                c.tuning = Some(t);
            }
            if let Some(t) = c.tuning.as_mut() {
                f(t);
            }
        });
        if let Err(ApiError::BadRequest(e)) = res {
            tracing::warn!("WEB: could not store tuning: {}", e);
        }
    }

    fn notify(&self, msg: &str) {
        if read_state(&self.shared).config.notifications.enabled {
            post_notification(self.dev.shell.as_ref(), msg);
        }
    }

    fn state(&self) -> ApiResult {
        let s = read_state(&self.shared);
        ok(json!({
            "snapshot": s.snapshot,
            "runtime": s.runtime,
            "config_rev": s.config_rev,
            "last_config_error": s.last_config_error,
            "daemon": { "vmrss_kb": read_vmrss_kb(&self.dev.sysfs) },
        }))
    }

    fn device_info(&self) -> ApiResult {
        let sys = &self.dev.sysfs;
        let (io_schedulers, io_scheduler) = tweaks::io_schedulers(sys);
        let (tcp_algorithms, tcp_congestion) = tweaks::tcp_congestion(sys);
        ok(json!({
            "soc": SocInfo::detect(self.dev.shell.as_ref()),
            "clusters": cpu::detect_clusters(sys),
            "cores": cpu::core_states(sys),
            "gpu": gpu::detect_gpu(&self.dev),
            "renderers": GpuRenderer::ALL,
            "thermal": {
                "available": sys.exists(thermal::SCONFIG),
                "preset": thermal::current_preset(sys),
                "presets": ThermalPreset::ALL,
            },
            "ram": RamConfig::read(&self.dev),
            "zram": ram::zram_status(sys),
            "charging": battery::charging_controls(sys),
            "io": { "current": io_scheduler, "available": io_schedulers },
            "tcp": { "current": tcp_congestion, "available": tcp_algorithms },
        }))
    }

    fn settings(&self, body: &[u8]) -> ApiResult {
        let req: SettingsReq = parse(body)?;
        self.update_config(|c| {
            if let Some(v) = req.set_on_boot {
                c.set_on_boot = v;
            }
            if let Some(v) = req.notifications {
                c.notifications.enabled = v;
            }
            if let Some(v) = req.poll_interval_secs {
                c.poll_interval_secs = v;
            }
            if req.perf_mode.is_some() {
                c.perf_mode = req.perf_mode;
            }
        })?;
        ok(json!({}))
    }

    fn record_apply(&self, cfg: TuningConfig, report: &ApplyReport) -> Result<(), ApiError> {
        write_state(&self.shared).runtime.last_apply = Some(report.clone());
        if !report.ok() {
            self.notify(&format!("Apply: {}", report.summary()));
        }
        self.update_config(|c| c.tuning = Some(cfg))
    }

    fn apply(&self, cfg: TuningConfig) -> ApiResult {
        cfg.ram.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;
        let report = apply_config(&self.dev, &cfg);
        self.record_apply(cfg, &report)?;
        let mut v = serde_json::to_value(&report).map_err(|e| ApiError::Failed(e.to_string()))?;
        v["ok"] = Value::Bool(report.ok());
        Ok(v)
    }

    fn cpu_frequency(&self, body: &[u8]) -> ApiResult {
        let req: CpuFreqReq = parse(body)?;
        let (min, max) = cpu::set_cluster_frequency(&self.dev, req.cluster, req.min, req.max)?;
        self.remember(|t| {
            if let Some(c) = t.cpu_clusters.get_mut(req.cluster) {
                c.min_freq = min;
                c.max_freq = max;
            }
        });
        ok(json!({ "min": min, "max": max }))
    }

    fn cpu_governor(&self, body: &[u8]) -> ApiResult {
        let req: GovernorReq = parse(body)?;
        match req.cluster {
            Some(i) => cpu::set_cluster_governor(&self.dev, i, &req.governor)?,
            None => {
                cpu::set_governor_all(&self.dev, &req.governor)?;
            }
        }
        self.remember(|t| {
            for (i, c) in t.cpu_clusters.iter_mut().enumerate() {
                if req.cluster.map_or(true, |want| want == i) {
                    c.governor = req.governor.clone();
                }
            }
        });
        ok(json!({ "governor": req.governor }))
    }

    fn cpu_core(&self, body: &[u8]) -> ApiResult {
        let req: CoreReq = parse(body)?;
        if req.core == 0 {
            return Err(ApiError::BadRequest("cpu0 cannot be hotplugged".to_string()));
        }
        cpu::set_core_online(&self.dev, req.core, req.online)?;
        let fresh = TuningConfig::capture(&self.dev);
        self.remember(|t| {
            for (c, f) in t.cpu_clusters.iter_mut().zip(&fresh.cpu_clusters) {
                c.disabled_cores = f.disabled_cores.clone();
            }
        });
        ok(json!({ "core": req.core, "online": req.online }))
    }

    fn cpu_lock_status(&self) -> ApiResult {
        let s = read_state(&self.shared);
        let policies: Vec<Value> = LockPolicy::ALL
            .iter()
            .map(|p| json!({ "name": p, "limits": p.limits() }))
            .collect();
        ok(json!({ "status": s.runtime.cpu_lock, "lock": s.config.cpu_lock, "policies": policies }))
    }

    fn cpu_lock(&self, body: &[u8]) -> ApiResult {
        let req: LockRequest = parse(body)?;
        let prev = read_state(&self.shared).config.cpu_lock.clone();
        let temp = cpu_lock::cpu_temp_mc(&thermal::read_temps(&self.dev.sysfs, &ZoneSet::detect(&self.dev.sysfs)));
        let outcome = cpu_lock::lock(&self.dev, &req, prev.as_ref(), temp).map_err(|e| match e {
            crate::error::Error::Invalid(m) => ApiError::BadRequest(m),
            e => e.into(),
        })?;
        let stored = outcome.lock.clone();
        self.update_config(|c| c.cpu_lock = Some(stored))?;
        let mut v = serde_json::to_value(&outcome).map_err(|e| ApiError::Failed(e.to_string()))?;
        v["ok"] = Value::Bool(outcome.failed.is_empty());
        Ok(v)
    }

    fn cpu_unlock(&self) -> ApiResult {
        let lock = read_state(&self.shared).config.cpu_lock.clone();
        let Some(lock) = lock else {
            return Err(ApiError::BadRequest("cpu frequencies are not locked".to_string()));
        };
        // The lock is dropped even when a cluster could not be restored.
        let res = cpu_lock::unlock(&self.dev, Some(&lock));
        self.update_config(|c| c.cpu_lock = None)?;
        res?;
        ok(json!({ "unlocked": lock.originals.keys().collect::<Vec<_>>() }))
    }

    fn gpu_frequency(&self, body: &[u8]) -> ApiResult {
        let req: GpuFreqReq = parse(body)?;
        let (min, max) = gpu::set_gpu_frequency(&self.dev, req.min, req.max)?;
        self.remember(|t| {
            if let Some(g) = t.gpu.as_mut() {
                g.min_freq = min;
                g.max_freq = max;
            }
        });
        ok(json!({ "min": min, "max": max }))
    }

    fn gpu_power_level(&self, body: &[u8]) -> ApiResult {
        let req: PowerLevelReq = parse(body)?;
        gpu::set_power_level(&self.dev, req.level)?;
        self.remember(|t| {
            if let Some(g) = t.gpu.as_mut() {
                g.power_level = Some(req.level);
            }
        });
        ok(json!({ "level": req.level }))
    }

    fn gpu_renderer(&self, body: &[u8]) -> ApiResult {
        let req: RendererReq = parse(body)?;
        let reboot_required = gpu::set_renderer(&self.dev, req.renderer)?;
        self.remember(|t| {
            if let Some(g) = t.gpu.as_mut() {
                g.renderer = req.renderer;
            }
        });
        ok(json!({ "renderer": req.renderer, "reboot_required": reboot_required }))
    }

    fn thermal(&self, body: &[u8]) -> ApiResult {
        let req: ThermalReq = parse(body)?;
        let applied = thermal::apply_thermal_preset(&self.dev, req.preset)?;
        self.remember(|t| {
            t.thermal.preset = req.preset;
            if let Some(b) = req.set_on_boot {
                t.thermal.set_on_boot = b;
            }
        });
        ok(json!({ "preset": req.preset, "applied": applied }))
    }

    fn ram(&self, body: &[u8]) -> ApiResult {
        let cfg: RamConfig = parse(body)?;
        cfg.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;
        let steps = ram::apply_ram_config(&self.dev, &cfg);
        let all_ok = !steps.iter().any(|s| s.is_failed());
        self.remember(|t| t.ram = cfg);
        Ok(json!({ "ok": all_ok, "steps": steps }))
    }

    fn tweaks(&self, body: &[u8]) -> ApiResult {
        let cfg: AdditionalConfig = parse(body)?;
        let steps = tweaks::apply_additional(&self.dev, &cfg);
        let all_ok = !steps.iter().any(|s| s.is_failed());
        if let Some(mode) = cfg.perf_mode {
            self.update_config(|c| c.perf_mode = Some(mode))?;
        }
        self.remember(|t| t.additional = cfg);
        Ok(json!({ "ok": all_ok, "steps": steps }))
    }

    fn export(&self) -> ApiResult {
        let (dir, stored_boot) = {
            let s = read_state(&self.shared);
            let boot = s.config.tuning.as_ref().map(|t| t.thermal.set_on_boot).unwrap_or(false);
            (s.config.export_dir.clone(), boot)
        };
        let mut cfg = TuningConfig::capture(&self.dev);
        cfg.thermal.set_on_boot = stored_boot;
        let info = SocInfo::detect(self.dev.shell.as_ref());
        let path = export_to_dir(&cfg, &info, &dir)?;
        ok(json!({ "path": path, "config": cfg }))
    }

    fn import(&self, body: &[u8], force: bool) -> ApiResult {
        let text = std::str::from_utf8(body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
        let current = SocInfo::detect(self.dev.shell.as_ref());
        let report = import_profile(text, &current).map_err(|e| ApiError::BadRequest(e.to_string()))?;

        if !report.compatible && !force {
            return Err(ApiError::Conflict(json!({
                "ok": false,
                "compatible": false,
                "warning": report.warning,
                "file_soc": report.file_soc,
                "current_soc": report.current_soc,
            })));
        }
        if let Some(w) = &report.warning {
            self.notify(w);
        }
        let mut v = self.apply(report.config)?;
        v["compatible"] = Value::Bool(report.compatible);
        v["warning"] = json!(report.warning);
        Ok(v)
    }

    fn charging(&self, body: &[u8]) -> ApiResult {
        let req: ChargingReq = parse(body)?;
        if let Some(on) = req.bypass {
            battery::set_bypass_charging(&self.dev, on)?;
        }
        if let Some(v) = req.limit {
            battery::set_charge_limit(&self.dev, v)?;
        }
        ok(json!({ "charging": battery::charging_controls(&self.dev.sysfs) }))
    }

    fn clear_ram(&self) -> ApiResult {
        let r = clear_ram(&self.dev)?;
        ok(json!({ "freed_mb": r.freed_mb, "before_kb": r.before_kb, "after_kb": r.after_kb }))
    }

    fn reboot(&self) -> ApiResult {
        self.dev.reboot()?;
        ok(json!({}))
    }

    fn profiles(&self, body: &[u8]) -> ApiResult {
        let list: Vec<AppProfile> = parse(body)?;
        self.update_config(|c| c.app_profiles = list)?;
        let n = read_state(&self.shared).config.app_profiles.len();
        ok(json!({ "count": n }))
    }

    fn games(&self, body: &[u8]) -> ApiResult {
        let gm: GameModeConfig = parse(body)?;
        self.update_config(|c| c.game_mode = gm)?;
        let n = read_state(&self.shared).config.game_mode.apps.len();
        ok(json!({ "count": n }))
    }
}

fn json_response(code: u16, v: &Value) -> Response<std::io::Cursor<Vec<u8>>> {
    let body = if v.is_null() { String::new() } else { v.to_string() };
    let resp = Response::from_string(body).with_status_code(StatusCode(code));
    match Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
        Ok(h) if !v.is_null() => resp.with_header(h),
        _ => resp,
    }
}

fn read_body(req: &mut Request) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = req.as_reader().read_to_end(&mut buf);
    buf
}

fn request_token(req: &Request) -> Option<String> {
    req.headers().iter().find_map(|h| {
        let v = h.value.as_str().trim();
        if h.field.equiv("Authorization") {
            v.strip_prefix("Bearer ").map(|t| t.trim().to_string())
        } else if h.field.equiv("X-Api-Token") {
            Some(v.to_string())
        } else {
            None
        }
    })
}

pub fn spawn(api: Api) {
    thread::spawn(move || {
        let addr = read_state(&api.shared).config.bind_addr.clone();
        let server = match Server::http(&addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("WEB: failed to bind {}: {}", addr, e);
                return;
            }
        };
        tracing::info!("WEB: http://{}", addr);

        for mut req in server.incoming_requests() {
            let url = req.url().to_string();
            let method = req.method().clone();
            let token = request_token(&req);

            let body = if matches!(method, Method::Post) {
                read_body(&mut req)
            } else {
                Vec::new()
            };

            let (code, v) = api.handle(&method, &url, token.as_deref(), &body);
            tracing::debug!("WEB: {} {} -> {}", method, url, code);
            let _ = req.respond(json_response(code, &v));
        }
    });
}
