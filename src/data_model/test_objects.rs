pub mod tests {
    use super::super::{
        Application, ApplicationAttemptId, ApplicationId, ApplicationState, Container, ContainerId,
        Resource,
    };

    pub const TEST_APPLICATION_ID: &str = "app-0001";

    pub fn application_id(id: &str) -> ApplicationId {
        ApplicationId::new(id)
    }

    pub fn container_id(app: &str, attempt: u32, sequence: u64) -> ContainerId {
        ContainerId::new(
            ApplicationAttemptId::new(ApplicationId::new(app), attempt),
            sequence,
        )
    }

    pub fn running_container(id: &ContainerId) -> Container {
        Container::new(id.clone(), Resource::new(1024, 1))
    }

    pub fn completed_container(id: &ContainerId, exit_code: i32) -> Container {
        let mut container = running_container(id);
        container.mark_done(exit_code, "container finished");
        container
    }

    pub fn application(id: &ApplicationId, state: ApplicationState) -> Application {
        Application::new(id.clone(), state)
    }
}
