//! 事件系统模块
//!
//! 提供统一的事件处理机制，沿用 Event/EventDispatcher 设计，
//! 并增加一个按帧排空的 `EventBus`，供交换链在重建后重新发布尺寸变化。
//!
//! # 设计原则
//!
//! - **类型安全**：事件类型用枚举标识，处理函数按类型匹配
//! - **拉取式分发**：发布只入队，由渲染线程在帧边界调用 `dispatch_pending`
//! - **处理链**：处理函数返回 `true` 表示事件已处理，后续订阅者不再收到
//!
//! # 使用示例
//!
//! ```
//! use dist_gfx::core::event::*;
//!
//! let mut event = WindowResizeEvent::new(1920, 1080);
//! let mut dispatcher = EventDispatcher::new(&mut event);
//!
//! dispatcher.dispatch(EventType::WindowResize, |e| {
//!     println!("窗口调整为: {}", e.detail());
//!     true
//! });
//! assert!(dispatcher.is_handled());
//! ```

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;

/// 事件类型枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// 窗口调整大小事件（来自窗口系统）
    WindowResize,

    /// 窗口关闭事件
    WindowClose,

    /// 渲染器尺寸变化事件
    ///
    /// 交换链重建完成后发布，依赖后备缓冲尺寸的资源（渲染目标等）据此重新分配
    RendererResize,
}

impl EventType {
    /// 获取事件类型的名称
    pub fn name(&self) -> &'static str {
        match self {
            EventType::WindowResize => "WindowResize",
            EventType::WindowClose => "WindowClose",
            EventType::RendererResize => "RendererResize",
        }
    }
}

/// 事件 trait
///
/// 所有事件都必须实现此 trait。`as_any` 用于处理函数取回具体类型。
pub trait Event: fmt::Debug {
    /// 获取事件类型
    fn event_type(&self) -> EventType;

    /// 获取事件详细信息（用于调试和日志）
    fn detail(&self) -> String {
        format!("{:?}", self)
    }

    /// 事件是否已被处理
    fn is_handled(&self) -> bool;

    /// 设置事件处理状态
    fn set_handled(&mut self, handled: bool);

    /// 以 `Any` 取回具体事件类型
    fn as_any(&self) -> &dyn Any;
}

/// 窗口调整大小事件
#[derive(Debug, Clone)]
pub struct WindowResizeEvent {
    /// 新的窗口宽度（像素）
    pub width: u32,

    /// 新的窗口高度（像素）
    pub height: u32,

    handled: bool,
}

impl WindowResizeEvent {
    /// 创建新的窗口调整大小事件
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            handled: false,
        }
    }

    /// 最小化时窗口系统会报告 0 尺寸，此时不应重建交换链
    pub fn is_minimized(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl Event for WindowResizeEvent {
    fn event_type(&self) -> EventType {
        EventType::WindowResize
    }

    fn detail(&self) -> String {
        format!("WindowResize: {}x{}", self.width, self.height)
    }

    fn is_handled(&self) -> bool {
        self.handled
    }

    fn set_handled(&mut self, handled: bool) {
        self.handled = handled;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 窗口关闭事件
#[derive(Debug, Clone, Default)]
pub struct WindowCloseEvent {
    handled: bool,
}

impl WindowCloseEvent {
    /// 创建新的窗口关闭事件
    pub fn new() -> Self {
        Self { handled: false }
    }
}

impl Event for WindowCloseEvent {
    fn event_type(&self) -> EventType {
        EventType::WindowClose
    }

    fn detail(&self) -> String {
        "WindowClose".to_string()
    }

    fn is_handled(&self) -> bool {
        self.handled
    }

    fn set_handled(&mut self, handled: bool) {
        self.handled = handled;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 渲染器尺寸变化事件
///
/// 携带交换链重建后的实际可绘制尺寸与在途帧数。
#[derive(Debug, Clone)]
pub struct RendererResizeEvent {
    /// 可绘制宽度（像素）
    pub width: u32,

    /// 可绘制高度（像素）
    pub height: u32,

    /// 重建后的在途帧数
    pub frames_in_flight: u32,

    handled: bool,
}

impl RendererResizeEvent {
    pub fn new(width: u32, height: u32, frames_in_flight: u32) -> Self {
        Self {
            width,
            height,
            frames_in_flight,
            handled: false,
        }
    }
}

impl Event for RendererResizeEvent {
    fn event_type(&self) -> EventType {
        EventType::RendererResize
    }

    fn detail(&self) -> String {
        format!(
            "RendererResize: {}x{} ({} frames in flight)",
            self.width, self.height, self.frames_in_flight
        )
    }

    fn is_handled(&self) -> bool {
        self.handled
    }

    fn set_handled(&mut self, handled: bool) {
        self.handled = handled;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 事件分发器
///
/// 持有单个事件的可变引用，按类型把事件交给处理函数。
pub struct EventDispatcher<'a> {
    event: &'a mut dyn Event,
}

impl<'a> EventDispatcher<'a> {
    /// 创建新的事件分发器
    pub fn new(event: &'a mut dyn Event) -> Self {
        Self { event }
    }

    /// 分发事件到处理函数
    ///
    /// 事件类型匹配时调用处理函数，并用其返回值设置处理状态。
    ///
    /// # 返回值
    ///
    /// - `true`: 事件类型匹配且处理函数返回 true
    /// - `false`: 事件类型不匹配或处理函数返回 false
    pub fn dispatch<F>(&mut self, event_type: EventType, mut handler: F) -> bool
    where
        F: FnMut(&mut dyn Event) -> bool,
    {
        if self.event.event_type() == event_type {
            let handled = handler(self.event);
            self.event.set_handled(handled);
            handled
        } else {
            false
        }
    }

    /// 获取事件是否已被处理
    pub fn is_handled(&self) -> bool {
        self.event.is_handled()
    }
}

/// 事件处理器 trait
pub trait EventHandler {
    /// 处理事件，返回 `true` 表示已处理
    fn handle_event(&mut self, event: &mut dyn Event) -> bool;
}

type Subscriber = Box<dyn FnMut(&mut dyn Event) -> bool>;

/// 事件总线
///
/// `publish` 只把事件放入队列；`dispatch_pending` 在调用线程上按发布顺序
/// 把每个事件依次交给订阅了该类型的处理函数，直到某个处理函数返回 `true`。
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<(EventType, Subscriber)>,
    pending: VecDeque<Box<dyn Event>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅某一类型的事件
    pub fn subscribe<F>(&mut self, event_type: EventType, handler: F)
    where
        F: FnMut(&mut dyn Event) -> bool + 'static,
    {
        self.subscribers.push((event_type, Box::new(handler)));
    }

    /// 发布事件（入队）
    pub fn publish<E: Event + 'static>(&mut self, event: E) {
        tracing::trace!(event = %event.detail(), "Event published");
        self.pending.push_back(Box::new(event));
    }

    /// 队列中尚未分发的事件数
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// 取出所有待分发事件，交给调用者自行处理
    pub fn drain(&mut self) -> Vec<Box<dyn Event>> {
        self.pending.drain(..).collect()
    }

    /// 分发所有待处理事件，返回分发的事件数
    pub fn dispatch_pending(&mut self) -> usize {
        let mut count = 0;
        while let Some(mut event) = self.pending.pop_front() {
            let event_type = event.event_type();
            let mut dispatcher = EventDispatcher::new(event.as_mut());
            for (subscribed, handler) in self.subscribers.iter_mut() {
                if *subscribed != event_type {
                    continue;
                }
                if dispatcher.dispatch(event_type, |e| handler(e)) {
                    break;
                }
            }
            count += 1;
        }
        count
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.len())
            .field("pending", &self.pending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_event_types() {
        assert_eq!(EventType::WindowResize.name(), "WindowResize");
        assert_eq!(EventType::RendererResize.name(), "RendererResize");
    }

    #[test]
    fn test_window_resize_event() {
        let mut event = WindowResizeEvent::new(1920, 1080);
        assert_eq!(event.event_type(), EventType::WindowResize);
        assert!(!event.is_handled());
        assert!(!event.is_minimized());

        event.set_handled(true);
        assert!(event.is_handled());

        assert!(WindowResizeEvent::new(0, 1080).is_minimized());
    }

    #[test]
    fn test_event_dispatcher_type_mismatch() {
        let mut event = WindowResizeEvent::new(800, 600);
        let mut dispatcher = EventDispatcher::new(&mut event);

        let handled = dispatcher.dispatch(EventType::WindowClose, |_e| {
            panic!("Should not be called");
        });

        assert!(!handled);
        assert!(!dispatcher.is_handled());
    }

    #[test]
    fn test_bus_delivers_in_publish_order() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut bus = EventBus::new();

        let sink = seen.clone();
        bus.subscribe(EventType::RendererResize, move |e| {
            let resize = e.as_any().downcast_ref::<RendererResizeEvent>().unwrap();
            sink.borrow_mut().push((resize.width, resize.height));
            false
        });

        bus.publish(RendererResizeEvent::new(640, 480, 3));
        bus.publish(WindowCloseEvent::new());
        bus.publish(RendererResizeEvent::new(800, 600, 2));
        assert_eq!(bus.pending_len(), 3);

        assert_eq!(bus.dispatch_pending(), 3);
        assert_eq!(bus.pending_len(), 0);
        assert_eq!(*seen.borrow(), vec![(640, 480), (800, 600)]);
    }

    #[test]
    fn test_bus_stops_after_handled() {
        let calls = Rc::new(RefCell::new(0));
        let mut bus = EventBus::new();

        let first = calls.clone();
        bus.subscribe(EventType::WindowClose, move |_| {
            *first.borrow_mut() += 1;
            true
        });
        let second = calls.clone();
        bus.subscribe(EventType::WindowClose, move |_| {
            *second.borrow_mut() += 100;
            true
        });

        bus.publish(WindowCloseEvent::new());
        bus.dispatch_pending();
        assert_eq!(*calls.borrow(), 1);
    }
}
