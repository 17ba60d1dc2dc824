use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A key-down event as delivered by whatever front end drives the dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyEvent {
    pub code: String,
    pub alt: bool,
    pub shift: bool,
    pub ctrl: bool,
    pub meta: bool,
}

impl KeyEvent {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shortcut {
    pub code: String,
    pub alt: bool,
    pub shift: bool,
    /// Satisfied by either Ctrl or Meta.
    pub control: bool,
}

impl Shortcut {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            alt: false,
            shift: false,
            control: false,
        }
    }

    pub fn with_alt(mut self) -> Self {
        self.alt = true;
        self
    }

    pub fn with_shift(mut self) -> Self {
        self.shift = true;
        self
    }

    pub fn with_control(mut self) -> Self {
        self.control = true;
        self
    }

    pub fn matches(&self, event: &KeyEvent) -> bool {
        self.alt == event.alt
            && self.shift == event.shift
            && self.control == (event.ctrl || event.meta)
            && self.code == event.code
    }
}

pub type ShortcutCallback = Arc<dyn Fn() + Send + Sync>;

/// Without a callback, a match activates the binding's target instead.
#[derive(Clone)]
pub struct ShortcutParams {
    pub shortcut: Shortcut,
    pub callback: Option<ShortcutCallback>,
}

impl ShortcutParams {
    pub fn new(shortcut: Shortcut, callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            shortcut,
            callback: Some(Arc::new(callback)),
        }
    }

    pub fn without_callback(shortcut: Shortcut) -> Self {
        Self {
            shortcut,
            callback: None,
        }
    }
}

#[derive(Default)]
struct DispatcherState {
    next_id: u64,
    listeners: BTreeMap<u64, ShortcutParams>,
}

/// Global key-down listener registry.
#[derive(Clone, Default)]
pub struct KeyDispatcher {
    state: Arc<Mutex<DispatcherState>>,
}

impl KeyDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the action of every matching listener. Returns true when at least
    /// one matched, meaning the event's default action should be suppressed.
    pub fn dispatch(&self, event: &KeyEvent) -> bool {
        let matching: Vec<Option<ShortcutCallback>> = self
            .lock()
            .listeners
            .values()
            .filter(|params| params.shortcut.matches(event))
            .map(|params| params.callback.clone())
            .collect();

        for action in matching.iter().flatten() {
            action();
        }
        !matching.is_empty()
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    fn add(&self, params: ShortcutParams) -> u64 {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.listeners.insert(id, params);
        id
    }

    fn remove(&self, id: u64) {
        self.lock().listeners.remove(&id);
    }

    fn lock(&self) -> MutexGuard<'_, DispatcherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One attachment point. At most one listener is active per binding.
pub struct ShortcutBinding {
    dispatcher: KeyDispatcher,
    target: Option<ShortcutCallback>,
    listener_id: Option<u64>,
}

impl ShortcutBinding {
    pub fn attach(dispatcher: &KeyDispatcher, params: Option<ShortcutParams>) -> Self {
        Self::bind(dispatcher, None, params)
    }

    /// Binds to an element whose activation (`target`) runs when the params
    /// carry no callback of their own.
    pub fn attach_to(
        dispatcher: &KeyDispatcher,
        target: impl Fn() + Send + Sync + 'static,
        params: Option<ShortcutParams>,
    ) -> Self {
        Self::bind(dispatcher, Some(Arc::new(target)), params)
    }

    fn bind(
        dispatcher: &KeyDispatcher,
        target: Option<ShortcutCallback>,
        params: Option<ShortcutParams>,
    ) -> Self {
        let mut binding = Self {
            dispatcher: dispatcher.clone(),
            target,
            listener_id: None,
        };
        binding.update(params);
        binding
    }

    pub fn update(&mut self, params: Option<ShortcutParams>) {
        self.destroy();
        if let Some(mut params) = params {
            params.callback = params.callback.or_else(|| self.target.clone());
            self.listener_id = Some(self.dispatcher.add(params));
        }
    }

    pub fn destroy(&mut self) {
        if let Some(id) = self.listener_id.take() {
            self.dispatcher.remove(id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.listener_id.is_some()
    }
}

impl Drop for ShortcutBinding {
    fn drop(&mut self) {
        self.destroy();
    }
}
