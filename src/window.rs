// Window host - winit implementation of the renderer's window contract

use raw_window_handle::{DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle};
use std::sync::Arc;
use winit::window::Window;

use crate::backend::WindowHost;

/// Shared handle to the application window.
#[derive(Clone)]
pub struct WinitWindow(Arc<Window>);

impl WinitWindow {
    pub fn new(window: Arc<Window>) -> Self {
        Self(window)
    }

    pub fn window(&self) -> &Window {
        &self.0
    }
}

impl HasWindowHandle for WinitWindow {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        self.0.window_handle()
    }
}

impl HasDisplayHandle for WinitWindow {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        self.0.display_handle()
    }
}

impl WindowHost for WinitWindow {
    fn framebuffer_size(&self) -> (u32, u32) {
        let size = self.0.inner_size();
        (size.width, size.height)
    }

    // The event loop is blocked inside RedrawRequested, so the size would
    // never change here. The app retries after the next Resized event.
    fn wait_events(&self) -> bool {
        false
    }
}
