//! Map-anchored cursor presence on top of the awareness table.
//!
//! ## Data flow
//!
//! ```text
//! pointer move (mouse only)
//!       │
//!       ▼
//! PresencePublisher::on_pointer_move()
//!       │  (rate-limited: 33ms)
//!       │  unproject screen → lng/lat
//!       ▼
//! awareness.update_local { cursor, zoom, sel }   ── one write
//!       │
//!       ▼   (relay frame / peer link)
//! remote AwarenessTable
//!       │
//!       ▼
//! remote_cursors()  (skips entries with an old heartbeat)
//! ```
//!
//! Fields written by this module:
//!
//! | Field  | Value                                   | Cleared on leave |
//! |--------|-----------------------------------------|------------------|
//! | cursor | `{lng, lat, screenX, screenY}` or null  | yes              |
//! | zoom   | map zoom or null                        | yes              |
//! | sel    | selected annotation ids                 | no               |
//! | ping   | epoch ms, written by the provider       | no               |

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::awareness::{AwarenessState, AwarenessTable};
use crate::identity::USER_FIELD;

pub const CURSOR_FIELD: &str = "cursor";
pub const ZOOM_FIELD: &str = "zoom";
pub const SELECTION_FIELD: &str = "sel";
pub const HEARTBEAT_FIELD: &str = "ping";

/// Minimum spacing between two cursor writes (~30 fps).
pub const CURSOR_BROADCAST_INTERVAL: Duration = Duration::from_millis(33);

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Geographic position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LngLat {
    pub lng: f64,
    pub lat: f64,
}

impl LngLat {
    pub fn new(lng: f64, lat: f64) -> Self {
        Self { lng, lat }
    }
}

/// Position in viewport pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenPoint {
    pub x: f64,
    pub y: f64,
}

impl ScreenPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// The map view the pointer moves over.
pub trait Viewport {
    fn unproject(&self, point: ScreenPoint) -> LngLat;
    fn zoom(&self) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerKind {
    Mouse,
    Pen,
    Touch,
}

/// Wire shape of the `cursor` field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPayload {
    pub lng: f64,
    pub lat: f64,
    pub screen_x: f64,
    pub screen_y: f64,
}

impl CursorPayload {
    fn at(viewport: &dyn Viewport, screen: ScreenPoint) -> Self {
        let pos = viewport.unproject(screen);
        Self {
            lng: pos.lng,
            lat: pos.lat,
            screen_x: screen.x,
            screen_y: screen.y,
        }
    }

    fn to_value(self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// RGBA color for cursor rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, vivid color derived from a client id.
    pub fn from_client_id(id: &str) -> Self {
        // FNV-1a keeps the hue identical across processes.
        let hash = id
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ b as u64).wrapping_mul(0x100_0000_01b3));
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Publisher
// ───────────────────────────────────────────────────────────────────

/// Writes the local cursor into the attached provider's awareness table.
///
/// Bound to one provider; build a new publisher when the session swaps
/// providers.
pub struct PresencePublisher {
    awareness: Arc<AwarenessTable>,
    interval: Duration,
    last_broadcast: Option<Instant>,
    last_screen: Option<ScreenPoint>,
}

impl PresencePublisher {
    pub fn new(awareness: Arc<AwarenessTable>) -> Self {
        Self::with_interval(awareness, CURSOR_BROADCAST_INTERVAL)
    }

    /// Custom rate bound (for testing).
    pub fn with_interval(awareness: Arc<AwarenessTable>, interval: Duration) -> Self {
        Self {
            awareness,
            interval,
            last_broadcast: None,
            last_screen: None,
        }
    }

    pub fn awareness(&self) -> &Arc<AwarenessTable> {
        &self.awareness
    }

    /// Handle a pointer move. Returns `true` if a write was made.
    ///
    /// Touch and pen input never publish a cursor.
    pub fn on_pointer_move(
        &mut self,
        kind: PointerKind,
        screen: ScreenPoint,
        viewport: &dyn Viewport,
        selection: &[String],
    ) -> bool {
        if kind != PointerKind::Mouse {
            return false;
        }
        self.last_screen = Some(screen);

        let now = Instant::now();
        if let Some(last) = self.last_broadcast {
            if now.saturating_duration_since(last) < self.interval {
                return false;
            }
        }
        self.last_broadcast = Some(now);

        let cursor = CursorPayload::at(viewport, screen).to_value();
        let zoom = json!(viewport.zoom());
        let sel = json!(selection);
        self.awareness.update_local(|state| {
            state.insert(CURSOR_FIELD.into(), cursor);
            state.insert(ZOOM_FIELD.into(), zoom);
            state.insert(SELECTION_FIELD.into(), sel);
        });
        true
    }

    /// Map moved under a still pointer: re-anchor the cursor, refresh zoom.
    pub fn on_viewport_change(&mut self, viewport: &dyn Viewport) {
        let cursor = self
            .last_screen
            .map(|screen| CursorPayload::at(viewport, screen).to_value());
        let zoom = json!(viewport.zoom());
        self.awareness.update_local(|state| {
            if let Some(cursor) = cursor {
                state.insert(CURSOR_FIELD.into(), cursor);
            }
            state.insert(ZOOM_FIELD.into(), zoom);
        });
    }

    /// Pointer left the map: null out `cursor` and `zoom`, keep the rest.
    pub fn on_pointer_leave(&mut self) {
        self.awareness.update_local(|state| {
            state.insert(CURSOR_FIELD.into(), Value::Null);
            state.insert(ZOOM_FIELD.into(), Value::Null);
        });
    }

    /// Teardown: same as leaving, and forget the last pointer position.
    pub fn clear(&mut self) {
        self.last_screen = None;
        self.on_pointer_leave();
    }
}

/// Refresh the heartbeat field with the current epoch time.
pub fn touch_heartbeat(awareness: &AwarenessTable) {
    awareness.set_local_field(HEARTBEAT_FIELD, json!(crate::unix_millis()));
}

// ───────────────────────────────────────────────────────────────────
// Reader
// ───────────────────────────────────────────────────────────────────

/// A remote cursor ready for rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCursor {
    pub client_id: String,
    pub position: LngLat,
    pub screen: ScreenPoint,
    pub zoom: Option<f64>,
    pub selection: Vec<String>,
    pub name: Option<String>,
    pub color: CursorColor,
}

/// Remote cursors whose heartbeat is at most `stale_after` old.
///
/// Entries without a heartbeat are kept; entries with a null cursor are
/// skipped. Sorted by client id.
pub fn remote_cursors(awareness: &AwarenessTable, now_ms: u64, stale_after: Duration) -> Vec<RemoteCursor> {
    let stale_ms = stale_after.as_millis() as u64;
    let mut cursors: Vec<RemoteCursor> = awareness
        .remote_states()
        .into_iter()
        .filter(|(_, state)| match state.get(HEARTBEAT_FIELD).and_then(Value::as_u64) {
            Some(ping) => now_ms.saturating_sub(ping) <= stale_ms,
            None => true,
        })
        .filter_map(|(client_id, state)| to_remote_cursor(client_id, &state))
        .collect();
    cursors.sort_by(|a, b| a.client_id.cmp(&b.client_id));
    cursors
}

fn to_remote_cursor(client_id: String, state: &AwarenessState) -> Option<RemoteCursor> {
    let cursor: CursorPayload = serde_json::from_value(state.get(CURSOR_FIELD)?.clone()).ok()?;
    let selection = state
        .get(SELECTION_FIELD)
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    let name = state
        .get(USER_FIELD)
        .and_then(|u| u.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(RemoteCursor {
        color: CursorColor::from_client_id(&client_id),
        position: LngLat::new(cursor.lng, cursor.lat),
        screen: ScreenPoint::new(cursor.screen_x, cursor.screen_y),
        zoom: state.get(ZOOM_FIELD).and_then(Value::as_f64),
        selection,
        name,
        client_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Origin;

    /// 1px = 0.5°, origin at (10, 50).
    struct FlatViewport {
        zoom: f64,
        offset_x: f64,
    }

    impl Viewport for FlatViewport {
        fn unproject(&self, p: ScreenPoint) -> LngLat {
            LngLat::new(10.0 + (p.x + self.offset_x) * 0.5, 50.0 - p.y * 0.5)
        }
        fn zoom(&self) -> f64 {
            self.zoom
        }
    }

    fn view() -> FlatViewport {
        FlatViewport {
            zoom: 12.0,
            offset_x: 0.0,
        }
    }

    fn publisher() -> PresencePublisher {
        PresencePublisher::new(Arc::new(AwarenessTable::new("me")))
    }

    #[tokio::test(start_paused = true)]
    async fn test_mouse_move_writes_all_fields_once() {
        let mut p = publisher();
        let sel = vec!["a1".to_string()];
        assert!(p.on_pointer_move(PointerKind::Mouse, ScreenPoint::new(100.0, 200.0), &view(), &sel));

        let state = p.awareness().local_state().unwrap();
        assert_eq!(state[CURSOR_FIELD]["lng"], json!(60.0));
        assert_eq!(state[CURSOR_FIELD]["lat"], json!(-50.0));
        assert_eq!(state[CURSOR_FIELD]["screenX"], json!(100.0));
        assert_eq!(state[ZOOM_FIELD], json!(12.0));
        assert_eq!(state[SELECTION_FIELD], json!(["a1"]));
        assert_eq!(p.awareness().clock("me"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_and_pen_ignored() {
        let mut p = publisher();
        let pt = ScreenPoint::new(1.0, 1.0);
        assert!(!p.on_pointer_move(PointerKind::Touch, pt, &view(), &[]));
        assert!(!p.on_pointer_move(PointerKind::Pen, pt, &view(), &[]));
        assert!(p.awareness().local_state().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_moves_are_rate_bounded() {
        let mut p = publisher();
        let v = view();
        assert!(p.on_pointer_move(PointerKind::Mouse, ScreenPoint::new(0.0, 0.0), &v, &[]));
        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(!p.on_pointer_move(PointerKind::Mouse, ScreenPoint::new(1.0, 0.0), &v, &[]));
        tokio::time::advance(Duration::from_millis(30)).await;
        assert!(p.on_pointer_move(PointerKind::Mouse, ScreenPoint::new(2.0, 0.0), &v, &[]));
        assert_eq!(p.awareness().clock("me"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_viewport_change_reanchors_cursor() {
        let mut p = publisher();
        p.on_pointer_move(PointerKind::Mouse, ScreenPoint::new(100.0, 0.0), &view(), &[]);

        let panned = FlatViewport {
            zoom: 13.0,
            offset_x: 100.0,
        };
        p.on_viewport_change(&panned);
        let state = p.awareness().local_state().unwrap();
        assert_eq!(state[CURSOR_FIELD]["lng"], json!(110.0));
        assert_eq!(state[CURSOR_FIELD]["screenX"], json!(100.0));
        assert_eq!(state[ZOOM_FIELD], json!(13.0));
    }

    #[test]
    fn test_viewport_change_without_pointer_only_sets_zoom() {
        let mut p = publisher();
        p.on_viewport_change(&view());
        let state = p.awareness().local_state().unwrap();
        assert!(state.get(CURSOR_FIELD).is_none());
        assert_eq!(state[ZOOM_FIELD], json!(12.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_nulls_cursor_and_zoom_only() {
        let mut p = publisher();
        p.awareness().set_local_field(USER_FIELD, json!({"pub": "pk", "name": "Ada"}));
        p.on_pointer_move(PointerKind::Mouse, ScreenPoint::new(5.0, 5.0), &view(), &["x".into()]);
        p.on_pointer_leave();

        let state = p.awareness().local_state().unwrap();
        assert_eq!(state[CURSOR_FIELD], Value::Null);
        assert_eq!(state[ZOOM_FIELD], Value::Null);
        assert_eq!(state[SELECTION_FIELD], json!(["x"]));
        assert_eq!(state[USER_FIELD]["name"], json!("Ada"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_cursors_skip_stale_heartbeats() {
        let remote = AwarenessTable::new("r1");
        let mut p = PresencePublisher::new(Arc::new(AwarenessTable::new("r2")));
        remote.update_local(|s| {
            s.insert(CURSOR_FIELD.into(), json!({"lng": 1.0, "lat": 2.0, "screenX": 3.0, "screenY": 4.0}));
            s.insert(HEARTBEAT_FIELD.into(), json!(1_000u64));
            s.insert(USER_FIELD.into(), json!({"pub": "pk", "name": "Grace"}));
        });
        p.on_pointer_move(PointerKind::Mouse, ScreenPoint::new(0.0, 0.0), &view(), &[]);
        p.awareness().set_local_field(HEARTBEAT_FIELD, json!(9_000u64));

        let reader = AwarenessTable::new("reader");
        reader.apply_update(&remote.encode_full().unwrap(), Origin::Relay).unwrap();
        reader.apply_update(&p.awareness().encode_full().unwrap(), Origin::Relay).unwrap();

        let all = remote_cursors(&reader, 10_000, Duration::from_secs(30));
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].client_id, "r1");
        assert_eq!(all[0].name.as_deref(), Some("Grace"));
        assert_eq!(all[0].position, LngLat::new(1.0, 2.0));

        let fresh = remote_cursors(&reader, 10_000, Duration::from_secs(5));
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].client_id, "r2");
    }

    #[test]
    fn test_remote_cursor_null_is_skipped() {
        let remote = AwarenessTable::new("r1");
        remote.set_local_field(CURSOR_FIELD, Value::Null);
        let reader = AwarenessTable::new("reader");
        reader.apply_update(&remote.encode_full().unwrap(), Origin::Relay).unwrap();
        assert!(remote_cursors(&reader, 0, Duration::from_secs(30)).is_empty());
    }

    #[test]
    fn test_cursor_color_stable() {
        let a = CursorColor::from_client_id("mappu_abc_1");
        let b = CursorColor::from_client_id("mappu_abc_1");
        assert_eq!(a, b);
        assert_eq!(a.a, 1.0);
        for c in a.to_array() {
            assert!((0.0..=1.0).contains(&c));
        }
    }

    #[test]
    fn test_heartbeat_field() {
        let table = AwarenessTable::new("me");
        touch_heartbeat(&table);
        assert!(table.local_state().unwrap()[HEARTBEAT_FIELD].as_u64().unwrap() > 0);
    }
}
