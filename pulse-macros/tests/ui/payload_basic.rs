use pulse_core::event::EventPayload;
use pulse_macros::EventPayload;
use serde::Serialize;

#[derive(Serialize, EventPayload)]
#[event(event_type = "job.run", priority = 5)]
struct JobRun {
    job_id: String,
}

#[derive(Serialize, EventPayload)]
struct Heartbeat;

#[derive(Serialize, EventPayload)]
#[event(priority = -1)]
enum WorkflowEvent {
    #[event(event_type = "workflow.completed", priority = 10)]
    Completed { workflow_id: String },
    Progress(u8),
    Idle,
}

fn main() {
    let run = JobRun { job_id: "j-1".into() };
    assert_eq!(run.event_type(), "job.run");
    assert_eq!(run.priority(), Some(5));
    assert_eq!(run.to_event_data().unwrap()["job_id"], "j-1");

    assert_eq!(Heartbeat.event_type(), "Heartbeat");
    assert_eq!(Heartbeat.priority(), None);

    let done = WorkflowEvent::Completed { workflow_id: "w".into() };
    assert_eq!(done.event_type(), "workflow.completed");
    assert_eq!(done.priority(), Some(10));
    assert_eq!(WorkflowEvent::Progress(3).event_type(), "WorkflowEvent.Progress");
    assert_eq!(WorkflowEvent::Idle.priority(), Some(-1));
}
