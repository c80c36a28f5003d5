//! Backend callbacks and event queuing for a session.

use std::ops::ControlFlow;
use std::sync::{Arc, Weak};

use tracing::trace;

use super::{LoaderShared, LoaderState};
use crate::backend::{BackendObserver, Pixbuf};
use crate::notify::AreaId;
use crate::scale::fit_within;
use crate::types::{FormatClass, LoaderEvent, Priority, Rect};

/// Formats whose buffers arrive with meaningful content and must not be
/// cleared on allocation.
const KEEP_PREPARED: [&str; 2] = ["svg", "xpm"];

impl LoaderShared {
    /// Queue an event on the consumer context.
    ///
    /// `make` runs at delivery, so it sees the session state of that moment.
    /// Nothing is delivered once the session is disposed.
    pub(super) fn queue_event<F>(self: &Arc<Self>, priority: Priority, make: F)
    where
        F: FnOnce(&LoaderState) -> Option<LoaderEvent> + Send + 'static,
    {
        let weak = Arc::downgrade(self);
        self.sources.add_once(&self.context, priority, move || {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let event = {
                let state = shared.state.lock();
                if state.disposed {
                    return;
                }
                make(&*state)
            };
            if let Some(event) = event {
                shared.dispatch(&event);
            }
        });
    }

    fn queue_area(self: &Arc<Self>, id: AreaId) {
        let weak = Arc::downgrade(self);
        self.sources.add_once(&self.context, Priority::HIGH, move || {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let rect = {
                let mut state = shared.state.lock();
                if state.disposed {
                    return;
                }
                state.areas.take(id)
            };
            if let Some(rect) = rect {
                shared.dispatch(&LoaderEvent::AreaReady(rect));
            }
        });
    }

    fn queue_size(self: &Arc<Self>) {
        self.queue_event(Priority::HIGH, |state| {
            Some(LoaderEvent::Size {
                width: state.actual_width,
                height: state.actual_height,
            })
        });
    }

    /// Make `pixbuf` the session's buffer if it is not already.
    pub(super) fn adopt_pixbuf(&self, state: &mut LoaderState, pixbuf: &Pixbuf) {
        if state
            .pixbuf
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, pixbuf))
        {
            return;
        }
        if self.file.has_extension(".jps") {
            pixbuf.set_stereo_cross(true);
        }
        state.pixbuf = Some(Arc::clone(pixbuf));
    }
}

/// The callbacks handed to a session's backend.
pub(crate) struct LoaderObserver {
    shared: Weak<LoaderShared>,
}

impl LoaderObserver {
    pub(crate) fn new(shared: Weak<LoaderShared>) -> Self {
        Self { shared }
    }
}

impl BackendObserver for LoaderObserver {
    fn area_updated(&self, pixbuf: &Pixbuf, rect: Rect) -> ControlFlow<()> {
        let Some(shared) = self.shared.upgrade() else {
            return ControlFlow::Break(());
        };

        let mut state = shared.state.lock();
        if state.pixbuf.is_none() {
            shared.adopt_pixbuf(&mut state, pixbuf);
        }
        if state.stopping {
            return ControlFlow::Break(());
        }

        if state.delay_area_ready {
            state.delayed_areas.push(rect);
        } else if let Some(id) = state.areas.push(rect) {
            drop(state);
            shared.queue_area(id);
        }
        ControlFlow::Continue(())
    }

    fn size_prepared(&self, width: u32, height: u32) -> Option<(u32, u32)> {
        let shared = self.shared.upgrade()?;

        let resize = {
            let mut state = shared.state.lock();
            // The first announcement decides; later ones get the same answer
            if state.size_known {
                return state
                    .shrunk
                    .then_some((state.actual_width, state.actual_height));
            }
            state.size_known = true;
            state.actual_width = width;
            state.actual_height = height;

            let (req_w, req_h) = (state.requested_width, state.requested_height);
            let can_shrink = shared.file.format_class == FormatClass::Video
                || state.format_tag.supports_shrink();

            if req_w < 1 || req_h < 1 || !can_shrink || (width <= req_w && height <= req_h) {
                None
            } else {
                let (w, h) = fit_within(req_w, req_h, width, height);
                trace!(width, height, w, h, "Shrinking to requested size");
                state.actual_width = w;
                state.actual_height = h;
                state.shrunk = true;
                Some((w, h))
            }
        };

        shared.queue_size();
        resize
    }

    fn area_prepared(&self, pixbuf: &Pixbuf) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let keep = shared
            .state
            .lock()
            .format_name
            .as_deref()
            .is_some_and(|name| KEEP_PREPARED.iter().any(|k| k.eq_ignore_ascii_case(name)));
        if !keep {
            pixbuf.clear();
        }
    }
}
