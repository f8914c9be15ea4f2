use zonegrid_application::VmService;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub vm_service: VmService,
    /// Executor URL advertised on mutation responses.
    pub workflow_api_url: String,
}
