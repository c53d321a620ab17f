//! The compositor boundary.
//!
//! Windows and layers are drawn by an external compositor; the kernel's
//! only coupling to it is the numeric layer id space, the active-layer
//! concept, and the routing map from layer ids to the tasks that should
//! receive their input. Window syscalls validate and then delegate through
//! the [`LayerService`] capability the compositor registers at boot.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use crate::sync::InterruptSafeLock;
use crate::task::TaskId;

/// Identifier in the compositor's layer space
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LayerId(pub u32);

/// Operations a task may request on a layer, forwarded to the compositor
/// by the main task
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LayerOperation {
    Move { x: i32, y: i32 },
    MoveRelative { dx: i32, dy: i32 },
    Draw,
}

/// Errors reported back across the layer boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerError {
    NoSuchLayer,
    NoCompositor,
}

/// Pixel layout of a drawing surface, chosen at construction
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    PackedRgb = 0,
    PackedBgr = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl PixelColor {
    /// Decode a 0x00RRGGBB value as passed through the window syscalls
    pub const fn from_u32(c: u32) -> Self {
        Self {
            r: (c >> 16) as u8,
            g: (c >> 8) as u8,
            b: c as u8,
        }
    }
}

/// Capability over one drawing surface: write a pixel, report the size.
/// The compositor selects the format-specific variant when it creates the
/// surface; nothing downstream branches on the format again.
pub trait DrawSurface {
    fn write_pixel(&mut self, x: u32, y: u32, color: PixelColor);
    fn size(&self) -> (u32, u32);
}

/// What the kernel needs from the compositor. Implemented outside the
/// core; every method is invoked with interrupts enabled from task
/// context.
pub trait LayerService: Send {
    fn open_window(
        &mut self,
        width: u32,
        height: u32,
        x: i32,
        y: i32,
        title: &str,
    ) -> Result<LayerId, LayerError>;
    fn close_layer(&mut self, id: LayerId) -> Result<(), LayerError>;
    fn apply(&mut self, id: LayerId, op: &LayerOperation) -> Result<(), LayerError>;
    fn draw(&mut self, id: LayerId) -> Result<(), LayerError>;
    fn write_string(
        &mut self,
        id: LayerId,
        x: i32,
        y: i32,
        color: PixelColor,
        s: &str,
    ) -> Result<(), LayerError>;
    fn fill_rectangle(
        &mut self,
        id: LayerId,
        x: i32,
        y: i32,
        w: i32,
        h: i32,
        color: PixelColor,
    ) -> Result<(), LayerError>;
    fn draw_line(
        &mut self,
        id: LayerId,
        x0: i32,
        y0: i32,
        x1: i32,
        y1: i32,
        color: PixelColor,
    ) -> Result<(), LayerError>;
}

/// Active layer plus the layer-to-task input routing map.
struct LayerRouter {
    active: Option<LayerId>,
    task_map: BTreeMap<LayerId, TaskId>,
}

static ROUTER: InterruptSafeLock<LayerRouter> = InterruptSafeLock::new(LayerRouter {
    active: None,
    task_map: BTreeMap::new(),
});

static SERVICE: InterruptSafeLock<Option<Box<dyn LayerService>>> = InterruptSafeLock::new(None);

/// Install the compositor. Called once at boot.
pub fn set_layer_service(service: Box<dyn LayerService>) {
    *SERVICE.lock() = Some(service);
}

/// Run `f` against the registered compositor.
pub fn with_service<R>(f: impl FnOnce(&mut dyn LayerService) -> Result<R, LayerError>) -> Result<R, LayerError> {
    let mut guard = SERVICE.lock();
    match guard.as_mut() {
        Some(s) => f(s.as_mut()),
        None => Err(LayerError::NoCompositor),
    }
}

/// Mark a layer as the input focus.
pub fn activate(id: LayerId) {
    ROUTER.lock().active = Some(id);
}

/// The layer currently holding input focus.
pub fn active_layer() -> Option<LayerId> {
    ROUTER.lock().active
}

/// Route input for `layer` to `task`.
pub fn register_layer_task(layer: LayerId, task: TaskId) {
    ROUTER.lock().task_map.insert(layer, task);
}

/// Remove a layer from the routing map (window closed).
pub fn unregister_layer(layer: LayerId) {
    let mut r = ROUTER.lock();
    r.task_map.remove(&layer);
    if r.active == Some(layer) {
        r.active = None;
    }
}

/// Which task should receive input aimed at `layer`?
pub fn task_for_layer(layer: LayerId) -> Option<TaskId> {
    ROUTER.lock().task_map.get(&layer).copied()
}

/// Routing target of the currently active layer.
pub fn active_task() -> Option<TaskId> {
    let r = ROUTER.lock();
    let active = r.active?;
    r.task_map.get(&active).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_follows_active_layer() {
        let la = LayerId(10);
        let lb = LayerId(11);
        register_layer_task(la, TaskId(5));
        register_layer_task(lb, TaskId(6));

        activate(la);
        assert_eq!(active_task(), Some(TaskId(5)));
        activate(lb);
        assert_eq!(active_task(), Some(TaskId(6)));

        unregister_layer(la);
        unregister_layer(lb);
        assert_eq!(active_task(), None);
    }

    #[test]
    fn test_unregister_clears_focus() {
        let l = LayerId(42);
        register_layer_task(l, TaskId(9));
        activate(l);
        unregister_layer(l);
        assert_eq!(active_layer(), None);
        assert_eq!(task_for_layer(l), None);
    }

    #[test]
    fn test_pixel_color_decode() {
        let c = PixelColor::from_u32(0x00AA_BB_CC);
        assert_eq!(c, PixelColor { r: 0xAA, g: 0xBB, b: 0xCC });
    }
}
